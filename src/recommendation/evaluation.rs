//! Offline evaluation
//!
//! Precision@K of the hybrid recommender against a per-user temporal
//! hold-out, and RMSE of collaborative-vector rating predictions.

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::engine::{RecommendOptions, RecommendationOrchestrator};
use super::interactions::{InteractionEvent, MAX_RATING};
use super::vector::{cosine_similarity, EmbeddingSpace};
use super::BookId;
use crate::error::{Error, Result};

/// Share of each user's latest interactions held out for testing
pub const DEFAULT_TEST_RATIO: f32 = 0.2;

/// Per-user chronological split
#[derive(Debug, Clone, Default)]
pub struct TrainTestSplit {
    pub train: BTreeMap<Uuid, Vec<InteractionEvent>>,
    pub test: BTreeMap<Uuid, Vec<InteractionEvent>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationReport {
    pub precision_at_k: Option<f32>,
    pub rmse: Option<f32>,
    pub num_eval_users: usize,
    pub num_rating_samples: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl EvaluationReport {
    fn empty(note: impl Into<String>) -> Self {
        Self {
            precision_at_k: None,
            rmse: None,
            num_eval_users: 0,
            num_rating_samples: 0,
            note: Some(note.into()),
        }
    }
}

/// Split each user's interactions by time: the latest
/// `max(1, floor(n * test_ratio))` go to test, the rest to train.
/// Users with fewer than `min_interactions` events are skipped.
pub fn train_test_split(
    interactions: &[InteractionEvent],
    min_interactions: usize,
    test_ratio: f32,
) -> TrainTestSplit {
    let mut by_user: BTreeMap<Uuid, Vec<InteractionEvent>> = BTreeMap::new();
    for event in interactions {
        by_user.entry(event.user_id).or_default().push(event.clone());
    }

    let mut split = TrainTestSplit::default();
    for (user_id, mut events) in by_user {
        if events.is_empty() || events.len() < min_interactions {
            continue;
        }

        // Stable sort keeps insertion order for equal timestamps
        events.sort_by_key(|e| e.created_at);
        let n = events.len();
        let test_size = ((n as f32 * test_ratio).floor() as usize).clamp(1, n);

        let test = events.split_off(n - test_size);
        split.train.insert(user_id, events);
        split.test.insert(user_id, test);
    }
    split
}

/// Fraction of the `k` slots filled with relevant books
pub fn precision_at_k(recommended: &[BookId], relevant: &HashSet<BookId>, k: usize) -> f32 {
    if k == 0 {
        return 0.0;
    }
    let hits = recommended
        .iter()
        .take(k)
        .collect::<HashSet<_>>()
        .into_iter()
        .filter(|id| relevant.contains(id))
        .count();
    hits as f32 / k as f32
}

/// Map a cosine similarity onto the rating scale: `2 + 3 * sim`
pub fn predicted_rating(similarity: f32) -> f32 {
    2.0 + 3.0 * similarity.clamp(-1.0, 1.0)
}

/// Root mean squared error over `(predicted, actual)` pairs
pub fn rmse(pairs: &[(f32, f32)]) -> Option<f32> {
    if pairs.is_empty() {
        return None;
    }
    let sum: f64 = pairs
        .iter()
        .map(|&(predicted, actual)| {
            let err = (predicted - actual) as f64;
            err * err
        })
        .sum();
    Some((sum / pairs.len() as f64).sqrt() as f32)
}

/// Users scored at once during `evaluate`
const EVAL_CONCURRENCY: usize = 8;

/// Precision and rating pairs for one held-out user
struct UserEvaluation {
    precision: f32,
    rating_pairs: Vec<(f32, f32)>,
}

/// Evaluate the orchestrator against the stored interaction log.
///
/// The live interaction log already contains the held-out events, so
/// recommendations are requested with interacted books included and the
/// user's training books filtered out afterwards. Users are scored
/// concurrently and do not count towards serving metrics.
#[instrument(skip(orchestrator))]
pub async fn evaluate(
    orchestrator: &RecommendationOrchestrator,
    k: usize,
    min_interactions: usize,
) -> Result<EvaluationReport> {
    let max_limit = orchestrator.config().max_limit;
    if k == 0 || k > max_limit {
        return Err(Error::bad_request(format!(
            "k must be between 1 and {}, got {}",
            max_limit, k
        )));
    }

    let interactions = orchestrator.store().list_interactions().await?;
    if interactions.is_empty() {
        return Ok(EvaluationReport::empty("No interactions recorded"));
    }

    let mut split = train_test_split(&interactions, min_interactions, DEFAULT_TEST_RATIO);
    if split.test.is_empty() {
        return Ok(EvaluationReport::empty(format!(
            "No users with >= {} interactions",
            min_interactions
        )));
    }

    let permits = Arc::new(Semaphore::new(EVAL_CONCURRENCY));
    let mut tasks = JoinSet::new();

    for (user_id, test_events) in std::mem::take(&mut split.test) {
        let train_books: HashSet<BookId> = split
            .train
            .remove(&user_id)
            .map(|events| events.iter().map(|e| e.book_id).collect())
            .unwrap_or_default();
        let permit = Arc::clone(&permits)
            .acquire_owned()
            .await
            .map_err(Error::internal)?;
        let orchestrator = orchestrator.clone();

        tasks.spawn(async move {
            let outcome =
                evaluate_user(&orchestrator, user_id, &train_books, &test_events, k).await;
            drop(permit);
            outcome
        });
    }

    let mut precisions = Vec::new();
    let mut rating_pairs = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        if let Some(user) = joined?? {
            precisions.push(user.precision);
            rating_pairs.extend(user.rating_pairs);
        }
    }

    let precision = if precisions.is_empty() {
        None
    } else {
        Some(precisions.iter().sum::<f32>() / precisions.len() as f32)
    };

    let report = EvaluationReport {
        precision_at_k: precision,
        rmse: rmse(&rating_pairs),
        num_eval_users: precisions.len(),
        num_rating_samples: rating_pairs.len(),
        note: None,
    };

    info!(
        users = report.num_eval_users,
        ratings = report.num_rating_samples,
        "Evaluation complete"
    );
    debug!(?report, "Evaluation report");

    Ok(report)
}

/// `None` when the recommender could not answer for this user
async fn evaluate_user(
    orchestrator: &RecommendationOrchestrator,
    user_id: Uuid,
    train_books: &HashSet<BookId>,
    test_events: &[InteractionEvent],
    k: usize,
) -> Result<Option<UserEvaluation>> {
    let options = RecommendOptions {
        include_interacted: true,
        ..RecommendOptions::default()
    };
    let relevant: HashSet<BookId> = test_events.iter().map(|e| e.book_id).collect();

    let request_k = (k + train_books.len()).min(orchestrator.config().max_limit);
    let recommended = match orchestrator.rank(user_id, request_k, &options).await {
        Ok(result) => result
            .items
            .into_iter()
            .map(|item| item.book_id)
            .filter(|id| !train_books.contains(id))
            .take(k)
            .collect::<Vec<_>>(),
        Err(e) => {
            warn!(user_id = %user_id, "Skipping user in evaluation: {}", e);
            return Ok(None);
        }
    };

    let mut evaluation = UserEvaluation {
        precision: precision_at_k(&recommended, &relevant, k),
        rating_pairs: Vec::new(),
    };

    let store = orchestrator.store();
    let user_cf = store
        .get_user_vectors(user_id)
        .await?
        .and_then(|vectors| vectors.collaborative);
    let Some(user_cf) = user_cf else {
        return Ok(Some(evaluation));
    };

    let rated: Vec<&InteractionEvent> = test_events.iter().filter(|e| e.rating.is_some()).collect();
    if rated.is_empty() {
        return Ok(Some(evaluation));
    }
    let ids: Vec<BookId> = rated.iter().map(|e| e.book_id).collect();
    let book_cf = store
        .get_book_vectors(EmbeddingSpace::Collaborative, &ids)
        .await?;

    for event in rated {
        let (Some(actual), Some(book_vector)) = (event.rating, book_cf.get(&event.book_id)) else {
            continue;
        };
        if let Some(sim) = cosine_similarity(user_cf.as_slice(), book_vector.as_slice()) {
            evaluation
                .rating_pairs
                .push((predicted_rating(sim), actual.min(MAX_RATING)));
        }
    }

    Ok(Some(evaluation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recommendation::interactions::InteractionType;
    use chrono::{Duration, Utc};

    fn event_at(user: Uuid, book: BookId, minutes: i64) -> InteractionEvent {
        InteractionEvent {
            user_id: user,
            book_id: book,
            interaction_type: InteractionType::View,
            rating: None,
            created_at: Utc::now() + Duration::minutes(minutes),
        }
    }

    #[test]
    fn test_split_holds_out_latest() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let mut events: Vec<InteractionEvent> = (0..10).map(|i| event_at(a, i, i)).collect();
        events.push(event_at(b, 100, 0));
        // Out of order on purpose
        events.reverse();

        let split = train_test_split(&events, 5, 0.2);
        assert!(!split.test.contains_key(&b));

        let test_ids: Vec<BookId> = split.test[&a].iter().map(|e| e.book_id).collect();
        assert_eq!(test_ids, vec![8, 9]);
        assert_eq!(split.train[&a].len(), 8);
    }

    #[test]
    fn test_split_always_holds_out_one() {
        let user = Uuid::new_v4();
        let events: Vec<InteractionEvent> = (0..3).map(|i| event_at(user, i, i)).collect();
        let split = train_test_split(&events, 1, 0.2);
        assert_eq!(split.test[&user].len(), 1);
        assert_eq!(split.train[&user].len(), 2);
    }

    #[test]
    fn test_precision_at_k() {
        let relevant: HashSet<BookId> = [2, 5, 9].into_iter().collect();
        assert_eq!(precision_at_k(&[1, 2, 3, 5], &relevant, 4), 0.5);
        // Short lists are still divided by k
        assert_eq!(precision_at_k(&[9], &relevant, 4), 0.25);
        assert_eq!(precision_at_k(&[], &relevant, 4), 0.0);
        assert_eq!(precision_at_k(&[2], &relevant, 0), 0.0);
    }

    #[test]
    fn test_predicted_rating_range() {
        assert_eq!(predicted_rating(1.0), 5.0);
        assert_eq!(predicted_rating(0.0), 2.0);
        assert_eq!(predicted_rating(-3.0), -1.0);
    }

    #[test]
    fn test_rmse() {
        assert_eq!(rmse(&[]), None);
        assert_eq!(rmse(&[(3.0, 3.0)]), Some(0.0));
        let value = rmse(&[(5.0, 3.0), (1.0, 3.0)]).unwrap();
        assert!((value - 2.0).abs() < 1e-6);
    }
}
