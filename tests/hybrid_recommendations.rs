//! End-to-end tests of the orchestrator over the in-memory store

use bookgraph::config::RecommendationConfig;
use bookgraph::error::Error;
use bookgraph::recommendation::evaluation;
use bookgraph::recommendation::{
    BookId, EmbeddingSpace, EmbeddingVector, FallbackReason, FallbackStrategy, InMemoryVectorStore,
    InteractionEvent, InteractionType, RecommendOptions, RecommendationOrchestrator,
    RecommendationStrategy, Recommendations, SpaceDimensions, StoredBook, UserVectors,
};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

fn config() -> RecommendationConfig {
    RecommendationConfig {
        dimensions: SpaceDimensions {
            content: 3,
            collaborative: 2,
            graph: 2,
        },
        space_timeout: Duration::from_millis(100),
        ..RecommendationConfig::default()
    }
}

fn orchestrator(store: InMemoryVectorStore) -> RecommendationOrchestrator {
    RecommendationOrchestrator::new(Arc::new(store), config()).unwrap()
}

fn cf_user(vector: Vec<f32>) -> UserVectors {
    UserVectors {
        content: None,
        collaborative: Some(EmbeddingVector::new(vector)),
    }
}

fn interaction(user: Uuid, book: BookId, minutes_ago: i64) -> InteractionEvent {
    InteractionEvent {
        user_id: user,
        book_id: book,
        interaction_type: InteractionType::Like,
        rating: None,
        created_at: Utc::now() - ChronoDuration::minutes(minutes_ago),
    }
}

fn ids(result: &Recommendations) -> Vec<BookId> {
    result.items.iter().map(|item| item.book_id).collect()
}

#[tokio::test]
async fn collaborative_only_user_keeps_cf_scale() {
    let user = Uuid::new_v4();
    let store = InMemoryVectorStore::new()
        .with_user(user, cf_user(vec![1.0, 0.0]))
        .with_book(
            StoredBook::new(1, "A")
                .with_vector(EmbeddingSpace::Collaborative, vec![0.9, 0.435_889_9]),
        )
        .with_book(
            StoredBook::new(2, "B")
                .with_vector(EmbeddingSpace::Collaborative, vec![0.7, 0.714_142_8]),
        )
        // Content vector only; the user has no content query
        .with_book(StoredBook::new(3, "C").with_vector(EmbeddingSpace::Content, vec![1.0, 0.0, 0.0]));

    let result = orchestrator(store)
        .recommend(user, 2, &RecommendOptions::default())
        .await
        .unwrap();

    assert_eq!(result.strategy, RecommendationStrategy::Hybrid);
    assert!(result.degraded_spaces.is_empty());
    assert_eq!(ids(&result), vec![1, 2]);
    assert!((result.items[0].score - 0.9).abs() < 1e-4);
    assert!((result.items[1].score - 0.7).abs() < 1e-4);
    for item in &result.items {
        assert!(item.breakdown.collaborative.is_some());
        assert!(item.breakdown.content.is_none());
        assert!(item.breakdown.graph.is_none());
    }
}

#[tokio::test]
async fn brand_new_user_gets_popularity_fallback() {
    let (user, other) = (Uuid::new_v4(), Uuid::new_v4());
    let store = InMemoryVectorStore::new()
        .with_user(user, UserVectors::default())
        .with_user(other, UserVectors::default())
        .with_book(StoredBook::new(1, "A"))
        .with_book(StoredBook::new(2, "B"))
        .with_book(StoredBook::new(3, "C"))
        .with_interaction(interaction(other, 3, 5))
        .with_interaction(interaction(other, 2, 4))
        .with_interaction(interaction(Uuid::new_v4(), 3, 3));

    let result = orchestrator(store)
        .recommend(user, 3, &RecommendOptions::default())
        .await
        .unwrap();

    assert_eq!(
        result.strategy,
        RecommendationStrategy::Fallback {
            strategy: FallbackStrategy::Popularity,
            reason: FallbackReason::NoQueryVectors,
        }
    );
    assert_eq!(ids(&result), vec![3, 2, 1]);
    let scores: Vec<f32> = result.items.iter().map(|i| i.score).collect();
    assert!((scores[0] - 1.0).abs() < 1e-6);
    assert!((scores[2] - 1.0 / 3.0).abs() < 1e-6);
    assert!(result.items.iter().all(|i| i.breakdown.is_empty()));
}

#[tokio::test]
async fn fallback_strategy_can_be_overridden() {
    let user = Uuid::new_v4();
    let now = Utc::now();
    let store = InMemoryVectorStore::new()
        .with_user(user, UserVectors::default())
        .with_book(StoredBook::new(1, "Old").with_created_at(now - ChronoDuration::days(10)))
        .with_book(StoredBook::new(2, "New").with_created_at(now));

    let options = RecommendOptions {
        fallback: Some(FallbackStrategy::MostRecent),
        ..RecommendOptions::default()
    };
    let result = orchestrator(store).recommend(user, 5, &options).await.unwrap();

    assert_eq!(ids(&result), vec![2, 1]);
    assert!(matches!(
        result.strategy,
        RecommendationStrategy::Fallback {
            strategy: FallbackStrategy::MostRecent,
            ..
        }
    ));
}

#[tokio::test]
async fn empty_catalog_is_an_error() {
    let user = Uuid::new_v4();
    let store = InMemoryVectorStore::new().with_user(user, cf_user(vec![1.0, 0.0]));

    let err = orchestrator(store)
        .recommend(user, 5, &RecommendOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::EmptyCatalog));
}

#[tokio::test]
async fn unknown_user_is_an_error() {
    let store = InMemoryVectorStore::new().with_book(StoredBook::new(1, "A"));

    let err = orchestrator(store)
        .recommend(Uuid::new_v4(), 5, &RecommendOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UserNotFound { .. }));
}

#[tokio::test]
async fn interacted_books_never_returned() {
    let user = Uuid::new_v4();
    let mut store = InMemoryVectorStore::new().with_user(user, cf_user(vec![1.0, 0.0]));
    for id in 1..=10 {
        let angle = id as f32 * 0.1;
        store = store.with_book(
            StoredBook::new(id, format!("Book {}", id))
                .with_vector(EmbeddingSpace::Collaborative, vec![angle.cos(), angle.sin()])
                .with_vector(EmbeddingSpace::Graph, vec![angle.sin(), angle.cos()]),
        );
    }
    // The closest books by CF are the ones the user has read
    let store = store
        .with_interaction(interaction(user, 1, 2))
        .with_interaction(interaction(user, 2, 1));

    let orchestrator = orchestrator(store);
    let result = orchestrator
        .recommend(user, 3, &RecommendOptions::default())
        .await
        .unwrap();

    assert_eq!(result.items.len(), 3);
    let returned: HashSet<BookId> = ids(&result).into_iter().collect();
    assert!(!returned.contains(&1));
    assert!(!returned.contains(&2));
    // Graph query comes from the interacted books
    assert!(result.items.iter().any(|i| i.breakdown.graph.is_some()));

    let options = RecommendOptions {
        include_interacted: true,
        ..RecommendOptions::default()
    };
    let with_seen = orchestrator.recommend(user, 3, &options).await.unwrap();
    assert!(ids(&with_seen).contains(&1));
}

#[tokio::test]
async fn fully_excluded_catalog_yields_empty_list() {
    let user = Uuid::new_v4();
    let store = InMemoryVectorStore::new()
        .with_user(user, cf_user(vec![1.0, 0.0]))
        .with_book(StoredBook::new(1, "A").with_vector(EmbeddingSpace::Collaborative, vec![1.0, 0.0]))
        .with_interaction(interaction(user, 1, 1));

    let result = orchestrator(store)
        .recommend(user, 5, &RecommendOptions::default())
        .await
        .unwrap();

    assert!(result.items.is_empty());
    assert_eq!(
        result.strategy,
        RecommendationStrategy::Fallback {
            strategy: FallbackStrategy::Popularity,
            reason: FallbackReason::NoCandidates,
        }
    );
}

#[tokio::test]
async fn ties_break_by_ascending_book_id() {
    let user = Uuid::new_v4();
    let tied = vec![0.75, 0.661_437_8];
    let store = InMemoryVectorStore::new()
        .with_user(user, cf_user(vec![1.0, 0.0]))
        .with_book(StoredBook::new(12, "Twelve").with_vector(EmbeddingSpace::Collaborative, tied.clone()))
        .with_book(StoredBook::new(7, "Seven").with_vector(EmbeddingSpace::Collaborative, tied))
        .with_book(StoredBook::new(3, "Three").with_vector(EmbeddingSpace::Collaborative, vec![0.0, 1.0]));

    let result = orchestrator(store)
        .recommend(user, 2, &RecommendOptions::default())
        .await
        .unwrap();

    assert_eq!(ids(&result), vec![7, 12]);
    assert_eq!(result.items[0].score, result.items[1].score);
    assert!((result.items[0].score - 0.75).abs() < 1e-4);
}

#[tokio::test]
async fn slow_space_is_reported_as_degraded() {
    let user = Uuid::new_v4();
    let store = InMemoryVectorStore::new()
        .with_user(
            user,
            UserVectors {
                content: Some(EmbeddingVector::new(vec![1.0, 0.0, 0.0])),
                collaborative: Some(EmbeddingVector::new(vec![1.0, 0.0])),
            },
        )
        .with_book(
            StoredBook::new(1, "A")
                .with_vector(EmbeddingSpace::Content, vec![1.0, 0.0, 0.0])
                .with_vector(EmbeddingSpace::Collaborative, vec![0.0, 1.0]),
        )
        .with_book(
            StoredBook::new(2, "B")
                .with_vector(EmbeddingSpace::Content, vec![0.0, 1.0, 0.0])
                .with_vector(EmbeddingSpace::Collaborative, vec![1.0, 0.0]),
        )
        .with_space_delay(EmbeddingSpace::Content, Duration::from_millis(500));

    let result = orchestrator(store)
        .recommend(user, 2, &RecommendOptions::default())
        .await
        .unwrap();

    assert_eq!(result.strategy, RecommendationStrategy::Hybrid);
    assert_eq!(result.degraded_spaces, vec![EmbeddingSpace::Content]);
    assert_eq!(ids(&result), vec![2, 1]);
    assert!(result.items.iter().all(|i| i.breakdown.content.is_none()));
}

#[tokio::test]
async fn failing_space_is_skipped() {
    let user = Uuid::new_v4();
    let store = InMemoryVectorStore::new()
        .with_user(
            user,
            UserVectors {
                content: Some(EmbeddingVector::new(vec![0.0, 0.0, 1.0])),
                collaborative: Some(EmbeddingVector::new(vec![1.0, 0.0])),
            },
        )
        .with_book(
            StoredBook::new(1, "A")
                .with_vector(EmbeddingSpace::Content, vec![0.0, 0.0, 1.0])
                .with_vector(EmbeddingSpace::Collaborative, vec![1.0, 0.0]),
        )
        .with_failing_space(EmbeddingSpace::Collaborative);

    let result = orchestrator(store)
        .recommend(user, 1, &RecommendOptions::default())
        .await
        .unwrap();

    assert_eq!(result.degraded_spaces, vec![EmbeddingSpace::Collaborative]);
    assert_eq!(result.items[0].breakdown.content, Some(1.0));
    assert_eq!(result.items[0].breakdown.collaborative, None);
}

#[tokio::test]
async fn all_spaces_down_falls_back() {
    let user = Uuid::new_v4();
    let store = InMemoryVectorStore::new()
        .with_user(user, cf_user(vec![1.0, 0.0]))
        .with_book(StoredBook::new(1, "A").with_vector(EmbeddingSpace::Collaborative, vec![1.0, 0.0]))
        .with_failing_space(EmbeddingSpace::Collaborative);

    let result = orchestrator(store)
        .recommend(user, 3, &RecommendOptions::default())
        .await
        .unwrap();

    assert_eq!(ids(&result), vec![1]);
    assert_eq!(result.degraded_spaces, vec![EmbeddingSpace::Collaborative]);
    assert_eq!(
        result.strategy,
        RecommendationStrategy::Fallback {
            strategy: FallbackStrategy::Popularity,
            reason: FallbackReason::AllSpacesUnavailable,
        }
    );
}

#[tokio::test]
async fn all_spaces_and_fallback_down_is_space_unavailable() {
    let user = Uuid::new_v4();
    let store = InMemoryVectorStore::new()
        .with_user(user, cf_user(vec![1.0, 0.0]))
        .with_book(StoredBook::new(1, "A").with_vector(EmbeddingSpace::Collaborative, vec![1.0, 0.0]))
        .with_failing_space(EmbeddingSpace::Collaborative)
        .with_failing_fallback();

    let err = orchestrator(store)
        .recommend(user, 3, &RecommendOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        Error::SpaceUnavailable {
            space: EmbeddingSpace::Collaborative,
            ..
        }
    ));
}

fn graph_reader_store(user: Uuid) -> InMemoryVectorStore {
    InMemoryVectorStore::new()
        .with_user(user, cf_user(vec![1.0, 0.0]))
        .with_book(
            StoredBook::new(1, "Read")
                .with_vector(EmbeddingSpace::Collaborative, vec![1.0, 0.0])
                .with_vector(EmbeddingSpace::Graph, vec![1.0, 0.0]),
        )
        .with_book(
            StoredBook::new(2, "Next")
                .with_vector(EmbeddingSpace::Collaborative, vec![0.8, 0.6])
                .with_vector(EmbeddingSpace::Graph, vec![1.0, 0.0]),
        )
        .with_interaction(interaction(user, 1, 1))
}

#[tokio::test]
async fn failing_graph_centroid_read_degrades_graph_only() {
    let user = Uuid::new_v4();
    let store = graph_reader_store(user).with_failing_space(EmbeddingSpace::Graph);

    let result = orchestrator(store)
        .recommend(user, 5, &RecommendOptions::default())
        .await
        .unwrap();

    assert_eq!(result.strategy, RecommendationStrategy::Hybrid);
    assert_eq!(result.degraded_spaces, vec![EmbeddingSpace::Graph]);
    assert_eq!(ids(&result), vec![2]);
    assert!((result.items[0].score - 0.8).abs() < 1e-4);
    assert_eq!(result.items[0].breakdown.graph, None);
}

#[tokio::test]
async fn slow_graph_centroid_read_is_bounded_by_space_timeout() {
    let user = Uuid::new_v4();
    let store =
        graph_reader_store(user).with_space_delay(EmbeddingSpace::Graph, Duration::from_millis(1500));

    let started = Instant::now();
    let result = orchestrator(store)
        .recommend(user, 5, &RecommendOptions::default())
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_millis(1000));
    assert_eq!(result.strategy, RecommendationStrategy::Hybrid);
    assert_eq!(result.degraded_spaces, vec![EmbeddingSpace::Graph]);
    assert_eq!(ids(&result), vec![2]);
}

#[tokio::test]
async fn failed_fallback_after_empty_hybrid_pass_returns_empty_list() {
    let user = Uuid::new_v4();
    let store = InMemoryVectorStore::new()
        .with_user(user, cf_user(vec![1.0, 0.0]))
        .with_book(StoredBook::new(1, "A").with_vector(EmbeddingSpace::Collaborative, vec![1.0, 0.0]))
        .with_interaction(interaction(user, 1, 1))
        .with_failing_fallback();

    let result = orchestrator(store)
        .recommend(user, 5, &RecommendOptions::default())
        .await
        .unwrap();

    assert!(result.items.is_empty());
    assert_eq!(result.strategy, RecommendationStrategy::Hybrid);
    assert!(result.degraded_spaces.is_empty());
}

#[tokio::test]
async fn evaluation_covers_every_eligible_user() {
    let users: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
    let mut store = InMemoryVectorStore::new();
    for id in 1..=6 {
        store = store.with_book(
            StoredBook::new(id, format!("Book {}", id))
                .with_vector(EmbeddingSpace::Collaborative, vec![1.0, id as f32 * 0.1]),
        );
    }
    for user in &users {
        store = store.with_user(*user, cf_user(vec![1.0, 0.0]));
        for id in 1..=5 {
            store = store.with_interaction(interaction(*user, id, 100 - id));
        }
    }
    // Below min_interactions, never evaluated
    let casual = Uuid::new_v4();
    let store = store
        .with_user(casual, cf_user(vec![1.0, 0.0]))
        .with_interaction(interaction(casual, 6, 1));

    let report = evaluation::evaluate(&orchestrator(store), 2, 5).await.unwrap();

    assert_eq!(report.num_eval_users, 3);
    assert!(report.precision_at_k.is_some());
    assert!(report.note.is_none());
}

#[tokio::test]
async fn evaluation_scores_held_out_interactions() {
    let user = Uuid::new_v4();
    let mut store = InMemoryVectorStore::new().with_user(user, cf_user(vec![1.0, 0.0]));
    for id in 1..=4 {
        store = store
            .with_book(
                StoredBook::new(id, format!("Read {}", id))
                    .with_vector(EmbeddingSpace::Collaborative, vec![0.9, 0.1]),
            )
            .with_interaction(interaction(user, id, 100 - id));
    }
    let held_out = InteractionEvent {
        user_id: user,
        book_id: 5,
        interaction_type: InteractionType::Rate,
        rating: Some(5.0),
        created_at: Utc::now(),
    };
    let store = store
        .with_book(StoredBook::new(5, "Next").with_vector(EmbeddingSpace::Collaborative, vec![1.0, 0.0]))
        .with_book(StoredBook::new(6, "Other").with_vector(EmbeddingSpace::Collaborative, vec![0.0, 1.0]))
        .with_interaction(held_out);

    let report = evaluation::evaluate(&orchestrator(store), 1, 5).await.unwrap();

    assert_eq!(report.num_eval_users, 1);
    assert_eq!(report.precision_at_k, Some(1.0));
    assert_eq!(report.num_rating_samples, 1);
    assert!(report.rmse.unwrap() < 1e-4);
}

#[tokio::test]
async fn evaluation_without_interactions_reports_note() {
    let store = InMemoryVectorStore::new().with_book(StoredBook::new(1, "A"));
    let report = evaluation::evaluate(&orchestrator(store), 5, 5).await.unwrap();
    assert_eq!(report.num_eval_users, 0);
    assert!(report.precision_at_k.is_none());
    assert!(report.note.is_some());
}
