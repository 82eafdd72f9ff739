//! BookGraph Recommendation Engine
//!
//! Hybrid book recommendations over content, collaborative and graph
//! embeddings, served over HTTP.
//!
//! # Graceful Shutdown
//!
//! SIGTERM and SIGINT stop the server from accepting connections, let
//! in-flight requests finish and close the database pool.

use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bookgraph::api::{self, AppState};
use bookgraph::database::{self, Database};
use bookgraph::error::Result;
use bookgraph::recommendation::{PgVectorStore, RecommendationOrchestrator, VectorStore};
use bookgraph::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with structured logging
    init_tracing();

    info!("BookGraph Engine v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Arc::new(Config::from_env()?);
    info!("Configuration loaded and validated");

    #[cfg(feature = "metrics")]
    install_metrics_exporter(config.api.metrics_port)?;

    // Create shutdown channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Initialize database connection pool, retrying while the database starts
    let db = database::with_retry(
        || Database::new(&config.database),
        5,
        Duration::from_secs(1),
    )
    .await?;
    info!("Database connection pool established");

    if config.database.run_migrations {
        database::run_migrations(db.pool()).await?;
    }

    let store: Arc<dyn VectorStore> = Arc::new(PgVectorStore::new(db.pool().clone()));
    let orchestrator = RecommendationOrchestrator::new(store, config.recommendation.clone())?;
    info!("Recommendation orchestrator ready: {:?}", orchestrator);

    let state = Arc::new(AppState {
        orchestrator,
        database: Some(db.clone()),
    });

    // Spawn API server
    let mut server = spawn_api_server(state, config.clone(), shutdown_tx.subscribe());
    info!("API: http://{}:{}", config.api.host, config.api.port);
    info!("Health: http://{}:{}/health", config.api.host, config.api.port);

    // Wait for shutdown signal or server failure
    tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
        _ = &mut server => {
            warn!("API server exited, initiating shutdown");
        }
    }

    info!("Initiating graceful shutdown...");
    let _ = shutdown_tx.send(());

    // Wait for in-flight requests with timeout
    let shutdown_timeout = Duration::from_secs(30);
    if !server.is_finished() && tokio::time::timeout(shutdown_timeout, server).await.is_err() {
        warn!("Shutdown timeout exceeded, forcing exit");
    }

    db.close().await;

    info!("BookGraph Engine stopped gracefully");
    Ok(())
}

/// Initialize structured logging with tracing
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        // Default log levels
        EnvFilter::new("bookgraph_engine=debug,bookgraph=debug,tower_http=debug,sqlx=warn,info")
    });

    let json = std::env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_current_span(true))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_ansi(std::env::var("NO_COLOR").is_err()),
            )
            .init();
    }
}

#[cfg(feature = "metrics")]
fn install_metrics_exporter(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .map_err(|e| bookgraph::error::Error::config(format!("metrics exporter: {}", e)))?;
    info!("Prometheus metrics on :{}/metrics", port);
    Ok(())
}

/// Spawn the API server
fn spawn_api_server(
    state: Arc<AppState>,
    config: Arc<Config>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.recv().await;
            info!("API server shutting down");
        };

        if let Err(e) = api::start_server(state, &config.api, shutdown).await {
            error!("API server error: {:?}", e);
        }
    })
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
