//! Vector storage interface
//!
//! The recommender reads vectors, interactions and catalog metadata through
//! the `VectorStore` trait. `PgVectorStore` (see `postgres.rs`) backs the
//! service; `InMemoryVectorStore` backs tests and local experiments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::interactions::InteractionEvent;
use super::vector::{EmbeddingSpace, EmbeddingVector};
use super::BookId;
use crate::error::{Error, Result};

/// Query-side vectors of a user. Users have no graph vector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserVectors {
    pub content: Option<EmbeddingVector>,
    pub collaborative: Option<EmbeddingVector>,
}

/// Display metadata attached to a recommendation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookSummary {
    pub id: BookId,
    pub title: String,
    pub author: Option<String>,
    pub genres: Vec<String>,
}

/// Catalog size and how many rows carry each embedding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingCoverage {
    pub users: u64,
    pub books: u64,
    pub interactions: u64,
    pub users_with_cf_vectors: u64,
    pub books_with_content_embeddings: u64,
    pub books_with_cf_embeddings: u64,
    pub books_with_gnn_vectors: u64,
}

/// Coverage as percentages, two decimals
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CoveragePercentages {
    pub content_embeddings: f64,
    pub cf_embeddings: f64,
    pub gnn_vectors: f64,
    pub user_cf_vectors: f64,
}

impl EmbeddingCoverage {
    pub fn percentages(&self) -> CoveragePercentages {
        CoveragePercentages {
            content_embeddings: percent(self.books_with_content_embeddings, self.books),
            cf_embeddings: percent(self.books_with_cf_embeddings, self.books),
            gnn_vectors: percent(self.books_with_gnn_vectors, self.books),
            user_cf_vectors: percent(self.users_with_cf_vectors, self.users),
        }
    }
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (part as f64 / total as f64 * 10_000.0).round() / 100.0
}

/// Non-personalized ordering used when hybrid retrieval cannot run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    /// Most interactions first, then ascending id
    Popularity,
    /// Newest catalog entries first, then ascending id
    MostRecent,
}

impl fmt::Display for FallbackStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackStrategy::Popularity => write!(f, "popularity"),
            FallbackStrategy::MostRecent => write!(f, "most_recent"),
        }
    }
}

impl FromStr for FallbackStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "popularity" | "popular" => Ok(FallbackStrategy::Popularity),
            "most_recent" | "recent" => Ok(FallbackStrategy::MostRecent),
            other => Err(Error::bad_request(format!(
                "unknown fallback strategy '{}'",
                other
            ))),
        }
    }
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Number of books in the catalog
    async fn count_books(&self) -> Result<u64>;

    /// `None` when the user does not exist
    async fn get_user_vectors(&self, user_id: Uuid) -> Result<Option<UserVectors>>;

    /// Searchable corpus for a space: every book that has a vector there,
    /// minus `exclude`
    async fn get_book_vector_pool(
        &self,
        space: EmbeddingSpace,
        exclude: &HashSet<BookId>,
    ) -> Result<Vec<(BookId, EmbeddingVector)>>;

    async fn get_interacted_books(&self, user_id: Uuid) -> Result<HashSet<BookId>>;

    /// Vectors in `space` for the given books; books without one are omitted
    async fn get_book_vectors(
        &self,
        space: EmbeddingSpace,
        book_ids: &[BookId],
    ) -> Result<HashMap<BookId, EmbeddingVector>>;

    async fn get_book_graph_vectors(
        &self,
        book_ids: &[BookId],
    ) -> Result<HashMap<BookId, EmbeddingVector>> {
        self.get_book_vectors(EmbeddingSpace::Graph, book_ids).await
    }

    /// Book ids in fallback order, at most `limit`
    async fn get_fallback_books(
        &self,
        strategy: FallbackStrategy,
        exclude: &HashSet<BookId>,
        limit: usize,
    ) -> Result<Vec<BookId>>;

    async fn get_book_summaries(&self, book_ids: &[BookId]) -> Result<HashMap<BookId, BookSummary>>;

    /// Append to the interaction log. Never called by the recommender.
    async fn record_interaction(&self, event: &InteractionEvent) -> Result<()>;

    /// Full interaction log in chronological order (offline evaluation)
    async fn list_interactions(&self) -> Result<Vec<InteractionEvent>>;

    /// Row counts and per-space embedding coverage
    async fn embedding_coverage(&self) -> Result<EmbeddingCoverage>;
}

// ============================================================================
// In-memory store
// ============================================================================

/// A book as held by the in-memory store
#[derive(Debug, Clone)]
pub struct StoredBook {
    pub summary: BookSummary,
    pub content: Option<EmbeddingVector>,
    pub collaborative: Option<EmbeddingVector>,
    pub graph: Option<EmbeddingVector>,
    pub created_at: DateTime<Utc>,
}

impl StoredBook {
    pub fn new(id: BookId, title: impl Into<String>) -> Self {
        Self {
            summary: BookSummary {
                id,
                title: title.into(),
                author: None,
                genres: Vec::new(),
            },
            content: None,
            collaborative: None,
            graph: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_vector(mut self, space: EmbeddingSpace, vector: Vec<f32>) -> Self {
        let vector = Some(EmbeddingVector::new(vector));
        match space {
            EmbeddingSpace::Content => self.content = vector,
            EmbeddingSpace::Collaborative => self.collaborative = vector,
            EmbeddingSpace::Graph => self.graph = vector,
        }
        self
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.summary.author = Some(author.into());
        self
    }

    pub fn with_genres(mut self, genres: &[&str]) -> Self {
        self.summary.genres = genres.iter().map(|g| g.to_string()).collect();
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    fn vector(&self, space: EmbeddingSpace) -> Option<&EmbeddingVector> {
        match space {
            EmbeddingSpace::Content => self.content.as_ref(),
            EmbeddingSpace::Collaborative => self.collaborative.as_ref(),
            EmbeddingSpace::Graph => self.graph.as_ref(),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    users: HashMap<Uuid, UserVectors>,
    books: BTreeMap<BookId, StoredBook>,
    interactions: Vec<InteractionEvent>,
}

/// Store held entirely in memory.
///
/// Builder methods populate it before it is shared. Per-space latency and
/// failure injection exercise the degraded-space paths of the recommender.
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    state: RwLock<MemoryState>,
    space_delays: HashMap<EmbeddingSpace, Duration>,
    failing_spaces: HashSet<EmbeddingSpace>,
    fallback_fails: bool,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user_id: Uuid, vectors: UserVectors) -> Self {
        self.state.get_mut().users.insert(user_id, vectors);
        self
    }

    pub fn with_book(mut self, book: StoredBook) -> Self {
        self.state.get_mut().books.insert(book.summary.id, book);
        self
    }

    pub fn with_interaction(mut self, event: InteractionEvent) -> Self {
        self.state.get_mut().interactions.push(event);
        self
    }

    /// Delay every vector read for `space`
    pub fn with_space_delay(mut self, space: EmbeddingSpace, delay: Duration) -> Self {
        self.space_delays.insert(space, delay);
        self
    }

    /// Make every vector read for `space` fail
    pub fn with_failing_space(mut self, space: EmbeddingSpace) -> Self {
        self.failing_spaces.insert(space);
        self
    }

    pub fn with_failing_fallback(mut self) -> Self {
        self.fallback_fails = true;
        self
    }

    async fn inject(&self, space: EmbeddingSpace) -> Result<()> {
        if let Some(delay) = self.space_delays.get(&space) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing_spaces.contains(&space) {
            return Err(Error::database(format!("{} vector read failed", space)));
        }
        Ok(())
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn count_books(&self) -> Result<u64> {
        Ok(self.state.read().await.books.len() as u64)
    }

    async fn get_user_vectors(&self, user_id: Uuid) -> Result<Option<UserVectors>> {
        Ok(self.state.read().await.users.get(&user_id).cloned())
    }

    async fn get_book_vector_pool(
        &self,
        space: EmbeddingSpace,
        exclude: &HashSet<BookId>,
    ) -> Result<Vec<(BookId, EmbeddingVector)>> {
        self.inject(space).await?;

        let state = self.state.read().await;
        Ok(state
            .books
            .iter()
            .filter(|(id, _)| !exclude.contains(id))
            .filter_map(|(id, book)| book.vector(space).map(|v| (*id, v.clone())))
            .collect())
    }

    async fn get_interacted_books(&self, user_id: Uuid) -> Result<HashSet<BookId>> {
        let state = self.state.read().await;
        Ok(state
            .interactions
            .iter()
            .filter(|event| event.user_id == user_id)
            .map(|event| event.book_id)
            .collect())
    }

    async fn get_book_vectors(
        &self,
        space: EmbeddingSpace,
        book_ids: &[BookId],
    ) -> Result<HashMap<BookId, EmbeddingVector>> {
        self.inject(space).await?;

        let state = self.state.read().await;
        Ok(book_ids
            .iter()
            .filter_map(|id| {
                state
                    .books
                    .get(id)
                    .and_then(|book| book.vector(space))
                    .map(|v| (*id, v.clone()))
            })
            .collect())
    }

    async fn get_fallback_books(
        &self,
        strategy: FallbackStrategy,
        exclude: &HashSet<BookId>,
        limit: usize,
    ) -> Result<Vec<BookId>> {
        if self.fallback_fails {
            return Err(Error::database("fallback query failed"));
        }

        let state = self.state.read().await;
        let mut ranked: Vec<&StoredBook> = state
            .books
            .values()
            .filter(|book| !exclude.contains(&book.summary.id))
            .collect();

        match strategy {
            FallbackStrategy::Popularity => {
                let mut counts: HashMap<BookId, usize> = HashMap::new();
                for event in &state.interactions {
                    *counts.entry(event.book_id).or_insert(0) += 1;
                }
                ranked.sort_by(|a, b| {
                    let ca = counts.get(&a.summary.id).copied().unwrap_or(0);
                    let cb = counts.get(&b.summary.id).copied().unwrap_or(0);
                    cb.cmp(&ca).then_with(|| a.summary.id.cmp(&b.summary.id))
                });
            }
            FallbackStrategy::MostRecent => {
                ranked.sort_by(|a, b| {
                    b.created_at
                        .cmp(&a.created_at)
                        .then_with(|| a.summary.id.cmp(&b.summary.id))
                });
            }
        }

        Ok(ranked
            .into_iter()
            .take(limit)
            .map(|book| book.summary.id)
            .collect())
    }

    async fn get_book_summaries(&self, book_ids: &[BookId]) -> Result<HashMap<BookId, BookSummary>> {
        let state = self.state.read().await;
        Ok(book_ids
            .iter()
            .filter_map(|id| state.books.get(id).map(|b| (*id, b.summary.clone())))
            .collect())
    }

    async fn record_interaction(&self, event: &InteractionEvent) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.users.contains_key(&event.user_id) || !state.books.contains_key(&event.book_id) {
            return Err(Error::bad_request("unknown user or book"));
        }
        state.interactions.push(event.clone());
        Ok(())
    }

    async fn list_interactions(&self) -> Result<Vec<InteractionEvent>> {
        let mut events = self.state.read().await.interactions.clone();
        events.sort_by_key(|event| event.created_at);
        Ok(events)
    }

    async fn embedding_coverage(&self) -> Result<EmbeddingCoverage> {
        let state = self.state.read().await;
        let books_with = |space: EmbeddingSpace| {
            state
                .books
                .values()
                .filter(|book| book.vector(space).is_some())
                .count() as u64
        };

        Ok(EmbeddingCoverage {
            users: state.users.len() as u64,
            books: state.books.len() as u64,
            interactions: state.interactions.len() as u64,
            users_with_cf_vectors: state
                .users
                .values()
                .filter(|user| user.collaborative.is_some())
                .count() as u64,
            books_with_content_embeddings: books_with(EmbeddingSpace::Content),
            books_with_cf_embeddings: books_with(EmbeddingSpace::Collaborative),
            books_with_gnn_vectors: books_with(EmbeddingSpace::Graph),
        })
    }
}
