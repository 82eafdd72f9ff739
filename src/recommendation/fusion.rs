//! Score fusion across embedding spaces
//!
//! A candidate may be scored by any subset of the spaces. Fusion takes the
//! weighted mean over the spaces that actually scored it:
//!
//! ```text
//! fused = Σ w[s]·score[s] / Σ w[s]     (s ranges over contributing spaces)
//! ```
//!
//! Renormalizing over contributing spaces keeps a book scored by one space
//! on the same scale as a book scored by all three. This favours cold-start
//! coverage over strict comparability between candidates with different
//! signal coverage.

use serde::{Deserialize, Serialize};

use super::vector::EmbeddingSpace;
use super::BookId;
use crate::error::{Error, Result};

/// Fusion weights per space (non-negative, need not sum to 1)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionWeights {
    pub content: f32,
    pub collaborative: f32,
    pub graph: f32,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            content: 0.5,
            collaborative: 0.3,
            graph: 0.2,
        }
    }
}

impl FusionWeights {
    /// Build weights, rejecting negative or non-finite values
    pub fn new(content: f32, collaborative: f32, graph: f32) -> Result<Self> {
        let weights = Self {
            content,
            collaborative,
            graph,
        };
        weights.validate()?;
        Ok(weights)
    }

    pub fn validate(&self) -> Result<()> {
        for space in EmbeddingSpace::ALL {
            let w = self.get(space);
            if !w.is_finite() || w < 0.0 {
                return Err(Error::InvalidConfig {
                    key: weight_key(space),
                    message: format!("weight must be a non-negative number, got {}", w).into(),
                });
            }
        }
        Ok(())
    }

    pub fn get(&self, space: EmbeddingSpace) -> f32 {
        match space {
            EmbeddingSpace::Content => self.content,
            EmbeddingSpace::Collaborative => self.collaborative,
            EmbeddingSpace::Graph => self.graph,
        }
    }
}

fn weight_key(space: EmbeddingSpace) -> &'static str {
    match space {
        EmbeddingSpace::Content => "REC_WEIGHT_CONTENT",
        EmbeddingSpace::Collaborative => "REC_WEIGHT_COLLABORATIVE",
        EmbeddingSpace::Graph => "REC_WEIGHT_GRAPH",
    }
}

/// Per-space similarity for one candidate; `None` means the space had no opinion
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SpaceScores {
    pub content: Option<f32>,
    pub collaborative: Option<f32>,
    pub graph: Option<f32>,
}

impl SpaceScores {
    pub fn get(&self, space: EmbeddingSpace) -> Option<f32> {
        match space {
            EmbeddingSpace::Content => self.content,
            EmbeddingSpace::Collaborative => self.collaborative,
            EmbeddingSpace::Graph => self.graph,
        }
    }

    pub fn set(&mut self, space: EmbeddingSpace, score: f32) {
        let slot = match space {
            EmbeddingSpace::Content => &mut self.content,
            EmbeddingSpace::Collaborative => &mut self.collaborative,
            EmbeddingSpace::Graph => &mut self.graph,
        };
        *slot = Some(score);
    }

    /// Spaces that produced a score
    pub fn contributing(&self) -> impl Iterator<Item = (EmbeddingSpace, f32)> + '_ {
        EmbeddingSpace::ALL
            .into_iter()
            .filter_map(|space| self.get(space).map(|score| (space, score)))
    }

    pub fn is_empty(&self) -> bool {
        self.contributing().next().is_none()
    }
}

/// Candidate assembled during a single request
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateScore {
    pub book_id: BookId,
    pub scores: SpaceScores,
    pub fused: Option<f32>,
}

/// Weighted, renormalized fusion.
///
/// Returns `None` when no space contributed, or when every contributing
/// space has zero weight. The result is clamped to `[0, 1]`; negative cosine
/// evidence ranks at the bottom.
pub fn fuse(scores: &SpaceScores, weights: &FusionWeights) -> Option<f32> {
    let mut weighted_sum = 0.0f32;
    let mut weight_sum = 0.0f32;

    for (space, score) in scores.contributing() {
        let w = weights.get(space);
        weighted_sum += w * score;
        weight_sum += w;
    }

    if weight_sum <= 0.0 {
        return None;
    }

    Some((weighted_sum / weight_sum).clamp(0.0, 1.0))
}

#[derive(Debug, Clone)]
pub struct ScoreFuser {
    weights: FusionWeights,
}

impl ScoreFuser {
    pub fn new(weights: FusionWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &FusionWeights {
        &self.weights
    }

    pub fn fuse(&self, scores: &SpaceScores) -> Option<f32> {
        fuse(scores, &self.weights)
    }

    /// Fill in `fused` for each candidate and drop those with no fused score
    pub fn fuse_all(&self, candidates: Vec<CandidateScore>) -> Vec<CandidateScore> {
        candidates
            .into_iter()
            .filter_map(|mut candidate| {
                candidate.fused = self.fuse(&candidate.scores);
                candidate.fused.map(|_| candidate)
            })
            .collect()
    }
}
