//! Postgres pool for the vector store
//!
//! The binary opens one pool at startup (retrying while the database comes
//! up), applies `migrations/` and hands the pool to `PgVectorStore`.

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::ConnectOptions;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Statements slower than this are logged at warn
const SLOW_STATEMENT: Duration = Duration::from_secs(1);

/// Upper bound for the retry backoff
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Open the pool and verify one round trip
    #[instrument(skip(config), fields(url = %crate::config::mask_url(&config.url)))]
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let options = PgConnectOptions::from_str(&config.url)
            .map_err(|e| Error::config(format!("Invalid database URL: {}", e)))?
            .statement_cache_capacity(config.statement_cache_size)
            .log_statements(log::LevelFilter::Debug)
            .log_slow_statements(log::LevelFilter::Warn, SLOW_STATEMENT);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect_with(options)
            .await
            .map_err(|e| Error::Database {
                message: format!("Failed to open vector store pool: {}", e).into(),
                source: Some(e),
            })?;

        let db = Self { pool };
        db.health_check().await?;

        info!(
            max = config.max_connections,
            size = db.pool.size(),
            "Vector store pool ready"
        );
        Ok(db)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// `SELECT 1` against the pool; backs `/ready`
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database {
                message: format!("Health check failed: {}", e).into(),
                source: Some(e),
            })?;
        Ok(())
    }

    pub async fn close(&self) {
        info!("Closing vector store pool");
        self.pool.close().await;
    }
}

/// Apply `migrations/` (users, books, interactions)
#[instrument(skip(pool))]
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| Error::Migration(e.to_string()))?;

    info!("Schema migrations applied");
    Ok(())
}

/// Retry `operation` with exponential backoff, capped at 30s between tries.
///
/// Only errors where `is_retryable()` holds are retried; anything else is
/// returned on the first failure.
pub async fn with_retry<T, F, Fut>(
    mut operation: F,
    max_attempts: u32,
    initial_delay: Duration,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = initial_delay;
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() || attempt >= max_attempts => return Err(e),
            Err(e) => {
                warn!(attempt, max_attempts, "Retrying after error: {}", e);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_RETRY_DELAY);
            }
        }
    }
}
