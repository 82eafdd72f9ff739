//! HTTP API Server for Recommendations
//!
//! REST endpoints over the recommendation orchestrator. Errors render as
//! `{"error": {"code", "message"}}` through `Error`'s `IntoResponse`.

use axum::{
    error_handling::HandleErrorLayer,
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tower::{BoxError, ServiceBuilder};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ApiConfig;
use crate::database::Database;
use crate::error::{Error, Result};
use crate::recommendation::evaluation::{self, EvaluationReport};
use crate::recommendation::{
    BookRecommendation, CoveragePercentages, EmbeddingCoverage, EmbeddingSpace, FallbackStrategy,
    InteractionEvent, InteractionType, RecommendOptions, RecommendationOrchestrator,
    RecommendationStrategy,
};

/// Shared application state
pub struct AppState {
    pub orchestrator: RecommendationOrchestrator,
    /// Absent when running against a non-database store
    pub database: Option<Database>,
}

/// Query params for the recommendations endpoint
#[derive(Debug, Default, Deserialize)]
pub struct RecommendationsQuery {
    pub limit: Option<usize>,
    pub fallback: Option<String>,
    #[serde(default)]
    pub include_interacted: bool,
    #[serde(default)]
    pub include_books: bool,
}

#[derive(Debug, Serialize)]
pub struct RecommendationsResponse {
    pub user_id: Uuid,
    pub items: Vec<BookRecommendation>,
    pub total: usize,
    pub strategy: RecommendationStrategy,
    pub degraded_spaces: Vec<EmbeddingSpace>,
}

/// Request body for recording interactions
#[derive(Debug, Deserialize)]
pub struct InteractionRequest {
    pub user_id: Uuid,
    pub book_id: i64,
    pub interaction_type: String,
    pub rating: Option<f32>,
}

/// Evaluation metrics next to catalog counts and embedding coverage
#[derive(Debug, Serialize)]
pub struct AnalyticsResponse {
    pub metrics: EvaluationReport,
    pub counts: EmbeddingCoverage,
    pub coverage: CoveragePercentages,
}

#[derive(Debug, Deserialize)]
pub struct EvaluationQuery {
    #[serde(default = "default_eval_k")]
    pub k: usize,
    #[serde(default = "default_min_interactions")]
    pub min_interactions: usize,
}

fn default_eval_k() -> usize {
    10
}

fn default_min_interactions() -> usize {
    5
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Build the router with CORS, tracing and request timeout layers
pub fn router(state: Arc<AppState>, config: &ApiConfig) -> Router {
    let request_timeout = config.request_timeout;

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/recommendations/:user_id", get(get_recommendations))
        .route("/api/v1/interactions", post(record_user_interaction))
        .route("/api/v1/analytics/metrics", get(get_analytics))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(&config.cors_origins))
                .layer(HandleErrorLayer::new(move |err: BoxError| async move {
                    middleware_error(err, request_timeout)
                }))
                .timeout(request_timeout),
        )
        .with_state(state)
}

/// Elapsed request timeouts become 504 `TIMEOUT`
fn middleware_error(err: BoxError, request_timeout: Duration) -> Error {
    if err.is::<tower::timeout::error::Elapsed>() {
        warn!("Request exceeded {:?}", request_timeout);
        Error::Timeout {
            timeout_ms: request_timeout.as_millis() as u64,
        }
    } else {
        Error::Internal { source: Some(err) }
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);

    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return cors.allow_origin(Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin '{}'", origin);
                None
            }
        })
        .collect();
    cors.allow_origin(parsed)
}

/// Start the API server and run until `shutdown` resolves
pub async fn start_server<F>(state: Arc<AppState>, config: &ApiConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state, config);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting recommendation API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::config(format!("Failed to bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Other(e.into()))?;

    info!("API server stopped");
    Ok(())
}

/// Health check endpoint
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness: the database answers (when there is one)
async fn readiness_check(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>> {
    if let Some(db) = &state.database {
        db.health_check().await?;
    }
    Ok(Json(HealthResponse {
        status: "ready".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}

/// Get personalized recommendations for a user
async fn get_recommendations(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(query): Query<RecommendationsQuery>,
) -> Result<Json<RecommendationsResponse>> {
    let user_id = parse_user_id(&user_id)?;
    let limit = query
        .limit
        .unwrap_or(state.orchestrator.config().default_limit);
    let fallback = query
        .fallback
        .as_deref()
        .map(str::parse::<FallbackStrategy>)
        .transpose()?;

    let options = RecommendOptions {
        include_interacted: query.include_interacted,
        include_books: query.include_books,
        fallback,
        weights: None,
    };

    let result = state.orchestrator.recommend(user_id, limit, &options).await?;

    Ok(Json(RecommendationsResponse {
        user_id,
        total: result.items.len(),
        items: result.items,
        strategy: result.strategy,
        degraded_spaces: result.degraded_spaces,
    }))
}

/// Record a user interaction
async fn record_user_interaction(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InteractionRequest>,
) -> Result<(StatusCode, Json<InteractionEvent>)> {
    let interaction_type: InteractionType = req.interaction_type.parse()?;
    let event = InteractionEvent::new(req.user_id, req.book_id, interaction_type, req.rating)?;

    state.orchestrator.store().record_interaction(&event).await?;

    Ok((StatusCode::CREATED, Json(event)))
}

/// Offline precision@k / RMSE plus embedding coverage of the catalog
async fn get_analytics(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EvaluationQuery>,
) -> Result<Json<AnalyticsResponse>> {
    let (metrics, counts) = tokio::try_join!(
        evaluation::evaluate(&state.orchestrator, query.k, query.min_interactions),
        state.orchestrator.store().embedding_coverage(),
    )?;

    Ok(Json(AnalyticsResponse {
        metrics,
        coverage: counts.percentages(),
        counts,
    }))
}

fn parse_user_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| Error::bad_request(format!("invalid user id '{}'", raw)))
}
