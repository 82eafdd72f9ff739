//! Recommendation Module
//!
//! Hybrid book recommendations over three embedding spaces.
//!
//! ## Architecture
//!
//! 1. **Vector** - Embedding spaces, vectors, cosine similarity
//! 2. **Similarity** - Per-space top-K retrieval (`SimilarityEngine`)
//! 3. **Fusion** - Weighted score fusion renormalized over contributing spaces
//! 4. **Engine** - The orchestrator: concurrent retrieval, fusion, fallback
//! 5. **Store** - `VectorStore` trait with Postgres and in-memory backends
//!
//! ## Spaces
//!
//! - **Content**: sentence-encoder embeddings of book text (768-d)
//! - **Collaborative**: matrix-factorization latent factors (128-d)
//! - **Graph**: node embeddings of the user-book graph (256-d); users have no
//!   graph vector, their query is the centroid of their interacted books

pub mod engine;
pub mod evaluation;
pub mod fusion;
pub mod interactions;
pub mod metrics;
pub mod postgres;
pub mod similarity;
pub mod store;
pub mod vector;

/// Catalog identifier of a book
pub type BookId = i64;

pub use engine::{
    BookRecommendation, FallbackReason, RecommendOptions, RecommendationOrchestrator,
    RecommendationStrategy, Recommendations,
};
pub use fusion::{FusionWeights, ScoreFuser, SpaceScores};
pub use interactions::{InteractionEvent, InteractionType};
pub use postgres::PgVectorStore;
pub use similarity::SimilarityEngine;
pub use store::{
    BookSummary, CoveragePercentages, EmbeddingCoverage, FallbackStrategy, InMemoryVectorStore,
    StoredBook, UserVectors, VectorStore,
};
pub use vector::{EmbeddingSpace, EmbeddingVector, SpaceDimensions};
