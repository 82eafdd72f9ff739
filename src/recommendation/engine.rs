//! Recommendation orchestrator
//!
//! Runs the hybrid pipeline for one user:
//!
//! 1. Plan query vectors (content and collaborative from the user row,
//!    graph as the centroid of the user's interacted books).
//! 2. Retrieve `k * over_fetch_multiplier` candidates per space, all spaces
//!    concurrently, each under its own timeout.
//! 3. Union the candidates, fuse their per-space scores and keep the top `k`.
//!
//! The graph centroid is read inside the graph task, so its store read is
//! bounded by the same timeout as the graph pool.
//!
//! A space that times out or errors is reported as degraded and the request
//! continues with the others. When no space can run, or the hybrid pass
//! produces nothing, the configured non-personalized fallback answers.

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::fusion::{CandidateScore, FusionWeights, ScoreFuser, SpaceScores};
use super::metrics::{self, PerformanceTimer, SpaceCoverage};
use super::similarity::{rank_order, SimilarityEngine};
use super::store::{BookSummary, FallbackStrategy, UserVectors, VectorStore};
use super::vector::{centroid, EmbeddingSpace, EmbeddingVector};
use super::BookId;
use crate::config::RecommendationConfig;
use crate::error::{Error, Result};

/// Per-request knobs
#[derive(Debug, Clone, Default)]
pub struct RecommendOptions {
    /// Keep books the user already interacted with
    pub include_interacted: bool,
    /// Attach title/author/genres to each item
    pub include_books: bool,
    /// Override the configured fallback ordering
    pub fallback: Option<FallbackStrategy>,
    /// Override the configured fusion weights
    pub weights: Option<FusionWeights>,
}

/// A single recommended book
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookRecommendation {
    pub book_id: BookId,
    /// Fused score in `[0, 1]`; rank-based for fallback results
    pub score: f32,
    /// Per-space scores; empty for fallback results
    pub breakdown: SpaceScores,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub book: Option<BookSummary>,
}

/// Why the fallback answered instead of the hybrid pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// The user has no usable vector in any space
    NoQueryVectors,
    /// Every queried space timed out or failed
    AllSpacesUnavailable,
    /// Spaces ran but produced no fusable candidate
    NoCandidates,
}

/// How a result list was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecommendationStrategy {
    Hybrid,
    Fallback {
        strategy: FallbackStrategy,
        reason: FallbackReason,
    },
}

impl RecommendationStrategy {
    fn metric_label(&self) -> &'static str {
        match self {
            RecommendationStrategy::Hybrid => "hybrid",
            RecommendationStrategy::Fallback {
                strategy: FallbackStrategy::Popularity,
                ..
            } => "popularity",
            RecommendationStrategy::Fallback {
                strategy: FallbackStrategy::MostRecent,
                ..
            } => "most_recent",
        }
    }
}

/// Result of one `recommend` call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendations {
    /// Best first; ties broken by ascending book id
    pub items: Vec<BookRecommendation>,
    pub strategy: RecommendationStrategy,
    /// Spaces that were queried but timed out or failed
    pub degraded_spaces: Vec<EmbeddingSpace>,
}

/// Query for one space
#[derive(Debug, Clone)]
enum SpaceQuery {
    /// Stored user vector
    Vector(EmbeddingVector),
    /// Centroid of these books' graph vectors
    Centroid(Vec<BookId>),
}

/// Outcome of the concurrent per-space retrieval
#[derive(Debug, Default)]
struct Retrieval {
    hits: Vec<(EmbeddingSpace, Vec<(BookId, f32)>)>,
    degraded: Vec<EmbeddingSpace>,
}

/// Hybrid recommender over a `VectorStore`.
///
/// Cheap to clone; the store is shared.
#[derive(Clone)]
pub struct RecommendationOrchestrator {
    store: Arc<dyn VectorStore>,
    engines: Vec<SimilarityEngine>,
    fuser: ScoreFuser,
    config: RecommendationConfig,
}

impl RecommendationOrchestrator {
    pub fn new(store: Arc<dyn VectorStore>, config: RecommendationConfig) -> Result<Self> {
        config.validate()?;

        let engines = EmbeddingSpace::ALL
            .into_iter()
            .map(|space| {
                SimilarityEngine::new(space, config.dimensions.get(space))
                    .with_parallel_threshold(config.parallel_threshold)
            })
            .collect();

        Ok(Self {
            store,
            engines,
            fuser: ScoreFuser::new(config.weights),
            config,
        })
    }

    pub fn config(&self) -> &RecommendationConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    fn engine(&self, space: EmbeddingSpace) -> &SimilarityEngine {
        // One engine per space, built in `EmbeddingSpace::ALL` order
        &self.engines[space as usize]
    }

    /// Top-`k` books for `user_id`, best first.
    #[instrument(skip(self, options))]
    pub async fn recommend(
        &self,
        user_id: Uuid,
        k: usize,
        options: &RecommendOptions,
    ) -> Result<Recommendations> {
        let timer = PerformanceTimer::new("recommend");
        let result = self.rank(user_id, k, options).await?;

        metrics::record_recommendation(result.strategy.metric_label(), result.items.len());
        for space in &result.degraded_spaces {
            metrics::record_space_unavailable(*space);
        }
        info!(
            strategy = result.strategy.metric_label(),
            returned = result.items.len(),
            degraded = result.degraded_spaces.len(),
            "Generated recommendations"
        );
        timer.log_if_slow(500);

        Ok(result)
    }

    /// `recommend` without serving metrics; offline evaluation goes through here
    pub(crate) async fn rank(
        &self,
        user_id: Uuid,
        k: usize,
        options: &RecommendOptions,
    ) -> Result<Recommendations> {
        if k == 0 || k > self.config.max_limit {
            return Err(Error::bad_request(format!(
                "k must be between 1 and {}, got {}",
                self.config.max_limit, k
            )));
        }
        if let Some(weights) = &options.weights {
            weights.validate()?;
        }

        if self.store.count_books().await? == 0 {
            return Err(Error::EmptyCatalog);
        }

        let user = self
            .store
            .get_user_vectors(user_id)
            .await?
            .ok_or_else(|| Error::UserNotFound {
                user_id: user_id.to_string(),
            })?;

        let interacted = self.store.get_interacted_books(user_id).await?;
        let queries = self.plan_queries(&user, &interacted);

        let exclude = if options.include_interacted {
            HashSet::new()
        } else {
            interacted
        };
        let fallback = options.fallback.unwrap_or(self.config.fallback_strategy);

        let pool_size = k.saturating_mul(self.config.over_fetch_multiplier);
        let retrieval = self.retrieve(queries, &exclude, pool_size).await;

        let mut result = if retrieval.hits.is_empty() && retrieval.degraded.is_empty() {
            debug!("No usable query vectors, answering with fallback");
            self.fallback(fallback, FallbackReason::NoQueryVectors, &exclude, k, Vec::new())
                .await?
        } else if retrieval.hits.is_empty() {
            let degraded = retrieval.degraded;
            match self
                .fallback(
                    fallback,
                    FallbackReason::AllSpacesUnavailable,
                    &exclude,
                    k,
                    degraded.clone(),
                )
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    let space = degraded.first().copied().unwrap_or(EmbeddingSpace::Content);
                    return Err(Error::space_unavailable(
                        space,
                        format!("all spaces unavailable and fallback failed: {}", e),
                    ));
                }
            }
        } else {
            let fuser = match options.weights {
                Some(weights) => ScoreFuser::new(weights),
                None => self.fuser.clone(),
            };
            let items = rank_candidates(&fuser, assemble_candidates(retrieval.hits), k);

            if items.is_empty() {
                match self
                    .fallback(
                        fallback,
                        FallbackReason::NoCandidates,
                        &exclude,
                        k,
                        retrieval.degraded.clone(),
                    )
                    .await
                {
                    Ok(result) => result,
                    Err(e) => {
                        // The spaces answered; an empty hybrid list is still valid
                        warn!("Fallback failed after an empty hybrid pass: {}", e);
                        Recommendations {
                            items,
                            strategy: RecommendationStrategy::Hybrid,
                            degraded_spaces: retrieval.degraded,
                        }
                    }
                }
            } else {
                let coverage = SpaceCoverage::from_scores(items.iter().map(|i| &i.breakdown));
                let single_space =
                    SpaceCoverage::single_space_ratio(items.iter().map(|i| &i.breakdown));
                debug!(
                    content = coverage.content,
                    collaborative = coverage.collaborative,
                    graph = coverage.graph,
                    single_space,
                    "Hybrid coverage"
                );
                Recommendations {
                    items,
                    strategy: RecommendationStrategy::Hybrid,
                    degraded_spaces: retrieval.degraded,
                }
            }
        };

        if options.include_books {
            self.hydrate(&mut result.items).await?;
        }

        Ok(result)
    }

    /// What each space searches with. Content and collaborative come from the
    /// user row; the graph query is resolved later, inside the graph task.
    fn plan_queries(
        &self,
        user: &UserVectors,
        interacted: &HashSet<BookId>,
    ) -> Vec<(EmbeddingSpace, SpaceQuery)> {
        let mut queries = Vec::with_capacity(EmbeddingSpace::ALL.len());

        for (space, vector) in [
            (EmbeddingSpace::Content, user.content.as_ref()),
            (EmbeddingSpace::Collaborative, user.collaborative.as_ref()),
        ] {
            if let Some(vector) = vector {
                match self.engine(space).check_dimension(vector) {
                    Ok(()) => queries.push((space, SpaceQuery::Vector(vector.clone()))),
                    Err(e) => warn!("Dropping user query vector: {}", e),
                }
            }
        }

        if !interacted.is_empty() {
            let mut ids: Vec<BookId> = interacted.iter().copied().collect();
            ids.sort_unstable();
            queries.push((EmbeddingSpace::Graph, SpaceQuery::Centroid(ids)));
        }

        queries
    }

    /// Run every space concurrently, each under `space_timeout`
    async fn retrieve(
        &self,
        queries: Vec<(EmbeddingSpace, SpaceQuery)>,
        exclude: &HashSet<BookId>,
        pool_size: usize,
    ) -> Retrieval {
        let mut retrieval = Retrieval::default();
        if queries.is_empty() {
            return retrieval;
        }

        let _timer = PerformanceTimer::new("retrieve");
        let exclude = Arc::new(exclude.clone());
        let timeout = self.config.space_timeout;
        let mut pending: HashSet<EmbeddingSpace> = HashSet::new();
        let mut tasks = JoinSet::new();

        for (space, query) in queries {
            pending.insert(space);
            let engine = self.engine(space).clone();
            let store = Arc::clone(&self.store);
            let exclude = Arc::clone(&exclude);

            tasks.spawn(async move {
                let outcome = tokio::time::timeout(
                    timeout,
                    search_space(store, engine, query, exclude, pool_size),
                )
                .await;
                (space, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (space, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!("Space retrieval task failed: {}", e);
                    continue;
                }
            };
            pending.remove(&space);

            match outcome {
                Ok(Ok(Some(hits))) => retrieval.hits.push((space, hits)),
                Ok(Ok(None)) => debug!(space = %space, "No usable query vector"),
                Ok(Err(e)) => {
                    warn!(space = %space, "Space unavailable: {}", e);
                    retrieval.degraded.push(space);
                }
                Err(_) => {
                    warn!(
                        space = %space,
                        timeout_ms = timeout.as_millis() as u64,
                        "Space timed out"
                    );
                    retrieval.degraded.push(space);
                }
            }
        }

        // Tasks that panicked never reported their space
        retrieval.degraded.extend(pending);

        retrieval.hits.sort_by_key(|(space, _)| *space);
        retrieval.degraded.sort();
        retrieval
    }

    async fn fallback(
        &self,
        strategy: FallbackStrategy,
        reason: FallbackReason,
        exclude: &HashSet<BookId>,
        k: usize,
        degraded_spaces: Vec<EmbeddingSpace>,
    ) -> Result<Recommendations> {
        let ids = self.store.get_fallback_books(strategy, exclude, k).await?;
        debug!(
            strategy = %strategy,
            reason = ?reason,
            returned = ids.len(),
            "Fallback recommendations"
        );

        Ok(Recommendations {
            items: rank_scored(ids),
            strategy: RecommendationStrategy::Fallback { strategy, reason },
            degraded_spaces,
        })
    }

    async fn hydrate(&self, items: &mut [BookRecommendation]) -> Result<()> {
        let ids: Vec<BookId> = items.iter().map(|i| i.book_id).collect();
        let mut summaries = self.store.get_book_summaries(&ids).await?;
        for item in items.iter_mut() {
            item.book = summaries.remove(&item.book_id);
        }
        Ok(())
    }
}

/// One space's retrieval. `Ok(None)` when the space has no usable query.
async fn search_space(
    store: Arc<dyn VectorStore>,
    engine: SimilarityEngine,
    query: SpaceQuery,
    exclude: Arc<HashSet<BookId>>,
    pool_size: usize,
) -> Result<Option<Vec<(BookId, f32)>>> {
    let query = match query {
        SpaceQuery::Vector(vector) => vector,
        SpaceQuery::Centroid(ids) => {
            match interacted_centroid(store.as_ref(), &engine, &ids).await? {
                Some(vector) => vector,
                None => return Ok(None),
            }
        }
    };

    let pool = store.get_book_vector_pool(engine.space(), &exclude).await?;

    let hits = tokio::task::spawn_blocking(move || {
        engine.top_k(
            &query,
            pool.iter().map(|(id, vector)| (*id, Some(vector))),
            pool_size,
            &exclude,
        )
    })
    .await??;

    Ok(Some(hits))
}

/// Mean graph vector of the interacted books, summed in id order
async fn interacted_centroid(
    store: &dyn VectorStore,
    engine: &SimilarityEngine,
    ids: &[BookId],
) -> Result<Option<EmbeddingVector>> {
    let vectors = store.get_book_graph_vectors(ids).await?;
    let usable: Vec<&EmbeddingVector> = ids
        .iter()
        .filter_map(|id| vectors.get(id))
        .filter(|v| engine.check_dimension(v).is_ok())
        .collect();
    if usable.len() < vectors.len() {
        warn!(
            skipped = vectors.len() - usable.len(),
            "Ignoring interacted graph vectors with wrong dimensionality"
        );
    }
    Ok(centroid(usable))
}

/// Union per-space hits into one candidate per book
fn assemble_candidates(hits: Vec<(EmbeddingSpace, Vec<(BookId, f32)>)>) -> Vec<CandidateScore> {
    let mut by_book: BTreeMap<BookId, SpaceScores> = BTreeMap::new();
    for (space, scored) in hits {
        for (book_id, score) in scored {
            by_book.entry(book_id).or_default().set(space, score);
        }
    }

    by_book
        .into_iter()
        .map(|(book_id, scores)| CandidateScore {
            book_id,
            scores,
            fused: None,
        })
        .collect()
}

fn rank_candidates(
    fuser: &ScoreFuser,
    candidates: Vec<CandidateScore>,
    k: usize,
) -> Vec<BookRecommendation> {
    let mut fused: Vec<(BookId, f32, SpaceScores)> = fuser
        .fuse_all(candidates)
        .into_iter()
        .filter_map(|c| c.fused.map(|score| (c.book_id, score, c.scores)))
        .collect();

    fused.sort_unstable_by(|a, b| rank_order(&(a.0, a.1), &(b.0, b.1)));
    fused.truncate(k);

    fused
        .into_iter()
        .map(|(book_id, score, breakdown)| BookRecommendation {
            book_id,
            score,
            breakdown,
            book: None,
        })
        .collect()
}

/// Rank-based scores `(n - i) / n` for an already ordered id list
fn rank_scored(ids: Vec<BookId>) -> Vec<BookRecommendation> {
    let n = ids.len();
    ids.into_iter()
        .enumerate()
        .map(|(i, book_id)| BookRecommendation {
            book_id,
            score: (n - i) as f32 / n as f32,
            breakdown: SpaceScores::default(),
            book: None,
        })
        .collect()
}

impl std::fmt::Debug for RecommendationOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecommendationOrchestrator")
            .field("weights", self.fuser.weights())
            .field("space_timeout", &self.config.space_timeout)
            .field("fallback", &self.config.fallback_strategy)
            .finish()
    }
}
