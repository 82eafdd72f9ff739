//! User-book interactions
//!
//! The interaction log is append-only. It is the training input for the CF
//! and graph models; the recommender itself only reads it (for exclusion,
//! the graph centroid, and the popularity fallback).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use super::BookId;
use crate::error::{Error, Result};

/// Highest accepted explicit rating
pub const MAX_RATING: f32 = 5.0;

/// Interaction types we track
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InteractionType {
    View,
    Like,
    Rate,
    Bookmark,
    Purchase,
}

impl std::fmt::Display for InteractionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InteractionType::View => write!(f, "view"),
            InteractionType::Like => write!(f, "like"),
            InteractionType::Rate => write!(f, "rate"),
            InteractionType::Bookmark => write!(f, "bookmark"),
            InteractionType::Purchase => write!(f, "purchase"),
        }
    }
}

impl FromStr for InteractionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "view" => Ok(InteractionType::View),
            "like" => Ok(InteractionType::Like),
            "rate" | "rating" => Ok(InteractionType::Rate),
            "bookmark" | "save" => Ok(InteractionType::Bookmark),
            "purchase" => Ok(InteractionType::Purchase),
            other => Err(Error::bad_request(format!(
                "unknown interaction type '{}'",
                other
            ))),
        }
    }
}

/// One entry of the interaction log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InteractionEvent {
    pub user_id: Uuid,
    pub book_id: BookId,
    pub interaction_type: InteractionType,
    pub rating: Option<f32>,
    pub created_at: DateTime<Utc>,
}

impl InteractionEvent {
    pub fn new(
        user_id: Uuid,
        book_id: BookId,
        interaction_type: InteractionType,
        rating: Option<f32>,
    ) -> Result<Self> {
        let event = Self {
            user_id,
            book_id,
            interaction_type,
            rating,
            created_at: Utc::now(),
        };
        event.validate()?;
        Ok(event)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(rating) = self.rating {
            if !rating.is_finite() || !(0.0..=MAX_RATING).contains(&rating) {
                return Err(Error::bad_request(format!(
                    "rating must be between 0 and {}, got {}",
                    MAX_RATING, rating
                )));
            }
        }
        if self.interaction_type == InteractionType::Rate && self.rating.is_none() {
            return Err(Error::bad_request("rate interactions require a rating"));
        }
        Ok(())
    }
}
