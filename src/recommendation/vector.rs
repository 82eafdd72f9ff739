//! Embedding spaces and vector math
//!
//! Three independently trained spaces feed the recommender. A vector either
//! exists in full for a space or is absent (`Option<EmbeddingVector>`); absent
//! vectors are never replaced with zeros, since a zero vector would read as
//! "maximally dissimilar" under cosine similarity.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the vector spaces a book can be embedded in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingSpace {
    /// Sentence-encoder embeddings of title, author and description
    Content,
    /// Latent factors from matrix factorization of the interaction log
    Collaborative,
    /// Node embeddings from the user-book interaction graph
    Graph,
}

impl EmbeddingSpace {
    pub const ALL: [EmbeddingSpace; 3] = [
        EmbeddingSpace::Content,
        EmbeddingSpace::Collaborative,
        EmbeddingSpace::Graph,
    ];

    /// Dimensionality produced by the training jobs
    pub const fn default_dimension(self) -> usize {
        match self {
            EmbeddingSpace::Content => 768,
            EmbeddingSpace::Collaborative => 128,
            EmbeddingSpace::Graph => 256,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            EmbeddingSpace::Content => "content",
            EmbeddingSpace::Collaborative => "collaborative",
            EmbeddingSpace::Graph => "graph",
        }
    }
}

impl fmt::Display for EmbeddingSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-space dimensionality, overridable for deployments with different models
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceDimensions {
    pub content: usize,
    pub collaborative: usize,
    pub graph: usize,
}

impl SpaceDimensions {
    pub fn get(&self, space: EmbeddingSpace) -> usize {
        match space {
            EmbeddingSpace::Content => self.content,
            EmbeddingSpace::Collaborative => self.collaborative,
            EmbeddingSpace::Graph => self.graph,
        }
    }
}

impl Default for SpaceDimensions {
    fn default() -> Self {
        Self {
            content: EmbeddingSpace::Content.default_dimension(),
            collaborative: EmbeddingSpace::Collaborative.default_dimension(),
            graph: EmbeddingSpace::Graph.default_dimension(),
        }
    }
}

/// A dense embedding, stored as a JSON array of floats
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmbeddingVector(Vec<f32>);

impl EmbeddingVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// L2 norm
    pub fn norm(&self) -> f32 {
        l2_norm(&self.0)
    }
}

impl From<Vec<f32>> for EmbeddingVector {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}

/// Cosine similarity, or `None` when the lengths differ.
///
/// A zero-norm operand has no direction and scores `0.0`. The result is
/// clamped to `[-1, 1]` to absorb floating point drift.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }
    let norm_a = l2_norm(a);
    let norm_b = l2_norm(b);
    if norm_a == 0.0 || norm_b == 0.0 {
        return Some(0.0);
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    Some((dot / (norm_a * norm_b)).clamp(-1.0, 1.0))
}

/// Arithmetic mean of the given vectors.
///
/// Returns `None` for an empty input or when the vectors disagree on length.
pub fn centroid<'a, I>(vectors: I) -> Option<EmbeddingVector>
where
    I: IntoIterator<Item = &'a EmbeddingVector>,
{
    let mut iter = vectors.into_iter();
    let first = iter.next()?;
    let mut sum: Vec<f64> = first.as_slice().iter().map(|&v| v as f64).collect();
    let mut count = 1usize;

    for vector in iter {
        if vector.len() != sum.len() {
            return None;
        }
        for (acc, &v) in sum.iter_mut().zip(vector.as_slice()) {
            *acc += v as f64;
        }
        count += 1;
    }

    Some(EmbeddingVector(
        sum.into_iter().map(|v| (v / count as f64) as f32).collect(),
    ))
}
