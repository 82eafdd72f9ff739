//! Nearest-neighbour retrieval within one embedding space
//!
//! A `SimilarityEngine` is configured for a single space and scores a pool of
//! book vectors against a query by cosine similarity. The orchestrator holds
//! one engine per space; adding a signal means configuring another engine.

use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::{debug, warn};

use super::vector::{cosine_similarity, EmbeddingSpace, EmbeddingVector};
use super::BookId;
use crate::error::{Error, Result};

/// Pools at or above this size are scored on the rayon pool
pub const DEFAULT_PARALLEL_THRESHOLD: usize = 2048;

#[derive(Debug, Clone)]
pub struct SimilarityEngine {
    space: EmbeddingSpace,
    dimension: usize,
    parallel_threshold: usize,
}

impl SimilarityEngine {
    pub fn new(space: EmbeddingSpace, dimension: usize) -> Self {
        Self {
            space,
            dimension,
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
        }
    }

    pub fn with_parallel_threshold(mut self, threshold: usize) -> Self {
        self.parallel_threshold = threshold.max(1);
        self
    }

    pub fn space(&self) -> EmbeddingSpace {
        self.space
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Fails with `DimensionMismatch` unless `vector` fits this space
    pub fn check_dimension(&self, vector: &EmbeddingVector) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(Error::DimensionMismatch {
                space: self.space,
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// Return the `k` most similar books to `query`, best first.
    ///
    /// Books in `exclude` and books without a vector are removed before
    /// ranking, so exclusions never shrink the result below `k` while eligible
    /// books remain. Pool vectors of the wrong length are skipped. Equal
    /// scores are ordered by ascending book id.
    pub fn top_k<'a, I>(
        &self,
        query: &EmbeddingVector,
        pool: I,
        k: usize,
        exclude: &HashSet<BookId>,
    ) -> Result<Vec<(BookId, f32)>>
    where
        I: IntoIterator<Item = (BookId, Option<&'a EmbeddingVector>)>,
    {
        self.check_dimension(query)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut malformed = 0usize;
        let eligible: Vec<(BookId, &EmbeddingVector)> = pool
            .into_iter()
            .filter(|(book_id, _)| !exclude.contains(book_id))
            .filter_map(|(book_id, vector)| {
                let vector = vector?;
                if vector.len() != self.dimension {
                    malformed += 1;
                    return None;
                }
                Some((book_id, vector))
            })
            .collect();

        if malformed > 0 {
            warn!(
                space = %self.space,
                expected = self.dimension,
                skipped = malformed,
                "Skipped book vectors with wrong dimensionality"
            );
        }

        let query = query.as_slice();
        let score = |&(book_id, vector): &(BookId, &EmbeddingVector)| {
            cosine_similarity(query, vector.as_slice())
                .filter(|s| s.is_finite())
                .map(|s| (book_id, s))
        };

        let mut scored: Vec<(BookId, f32)> = if eligible.len() >= self.parallel_threshold {
            eligible.par_iter().filter_map(score).collect()
        } else {
            eligible.iter().filter_map(score).collect()
        };

        scored.sort_unstable_by(rank_order);
        scored.truncate(k);

        debug!(
            space = %self.space,
            eligible = eligible.len(),
            returned = scored.len(),
            "Scored candidate pool"
        );

        Ok(scored)
    }
}

/// Descending score, then ascending id
pub(crate) fn rank_order(a: &(BookId, f32), b: &(BookId, f32)) -> Ordering {
    b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> SimilarityEngine {
        SimilarityEngine::new(EmbeddingSpace::Collaborative, 2)
    }

    fn pool() -> Vec<(BookId, Option<EmbeddingVector>)> {
        vec![
            (1, Some(EmbeddingVector::new(vec![1.0, 0.0]))),
            (2, Some(EmbeddingVector::new(vec![0.0, 1.0]))),
            (3, Some(EmbeddingVector::new(vec![1.0, 1.0]))),
            (4, None),
            (5, Some(EmbeddingVector::new(vec![-1.0, 0.0]))),
        ]
    }

    fn as_refs(
        pool: &[(BookId, Option<EmbeddingVector>)],
    ) -> impl Iterator<Item = (BookId, Option<&EmbeddingVector>)> + '_ {
        pool.iter().map(|(id, v)| (*id, v.as_ref()))
    }

    #[test]
    fn test_top_k_orders_by_similarity() {
        let pool = pool();
        let query = EmbeddingVector::new(vec![1.0, 0.1]);
        let result = engine()
            .top_k(&query, as_refs(&pool), 2, &HashSet::new())
            .unwrap();
        let ids: Vec<BookId> = result.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_top_k_skips_missing_vectors() {
        let pool = pool();
        let query = EmbeddingVector::new(vec![1.0, 0.0]);
        let result = engine()
            .top_k(&query, as_refs(&pool), 10, &HashSet::new())
            .unwrap();
        assert_eq!(result.len(), 4);
        assert!(result.iter().all(|(id, _)| *id != 4));
    }

    #[test]
    fn test_top_k_larger_than_pool_returns_sorted_pool() {
        let pool = pool();
        let query = EmbeddingVector::new(vec![0.0, 1.0]);
        let result = engine()
            .top_k(&query, as_refs(&pool), 100, &HashSet::new())
            .unwrap();
        assert_eq!(result.len(), 4);
        for pair in result.windows(2) {
            assert!(pair[0].1 >= pair[1].1);
        }
    }

    #[test]
    fn test_exclusion_applies_before_truncation() {
        let pool = pool();
        let query = EmbeddingVector::new(vec![1.0, 0.0]);
        let exclude: HashSet<BookId> = [1].into_iter().collect();
        let result = engine().top_k(&query, as_refs(&pool), 2, &exclude).unwrap();
        let ids: Vec<BookId> = result.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![3, 2]);
    }

    #[test]
    fn test_ties_break_by_ascending_id() {
        let pool = vec![
            (12, Some(EmbeddingVector::new(vec![1.0, 0.0]))),
            (7, Some(EmbeddingVector::new(vec![2.0, 0.0]))),
            (9, Some(EmbeddingVector::new(vec![3.0, 0.0]))),
        ];
        let query = EmbeddingVector::new(vec![1.0, 0.0]);
        let result = engine()
            .top_k(&query, as_refs(&pool), 3, &HashSet::new())
            .unwrap();
        let ids: Vec<BookId> = result.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![7, 9, 12]);
    }

    #[test]
    fn test_query_dimension_mismatch() {
        let pool = pool();
        let query = EmbeddingVector::new(vec![1.0, 0.0, 0.0]);
        let err = engine()
            .top_k(&query, as_refs(&pool), 2, &HashSet::new())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 2,
                actual: 3,
                ..
            }
        ));
    }

    #[test]
    fn test_malformed_pool_vector_is_skipped() {
        let pool = vec![
            (1, Some(EmbeddingVector::new(vec![1.0, 0.0, 5.0]))),
            (2, Some(EmbeddingVector::new(vec![1.0, 0.0]))),
        ];
        let query = EmbeddingVector::new(vec![1.0, 0.0]);
        let result = engine()
            .top_k(&query, as_refs(&pool), 5, &HashSet::new())
            .unwrap();
        assert_eq!(result, vec![(2, 1.0)]);
    }

    #[test]
    fn test_parallel_path_matches_sequential() {
        let pool: Vec<(BookId, Option<EmbeddingVector>)> = (0..500)
            .map(|i| {
                let angle = i as f32 * 0.37;
                (i as BookId, Some(EmbeddingVector::new(vec![angle.cos(), angle.sin()])))
            })
            .collect();
        let query = EmbeddingVector::new(vec![0.6, 0.8]);
        let exclude: HashSet<BookId> = [3, 17, 42].into_iter().collect();

        let sequential = engine()
            .with_parallel_threshold(usize::MAX)
            .top_k(&query, as_refs(&pool), 25, &exclude)
            .unwrap();
        let parallel = engine()
            .with_parallel_threshold(1)
            .top_k(&query, as_refs(&pool), 25, &exclude)
            .unwrap();
        assert_eq!(sequential, parallel);
    }
}
