//! Configuration management for the BookGraph engine
//!
//! Strongly-typed configuration loaded from environment variables, with
//! defaults and a validation pass. A `.env` file is read first if present.
//!
//! # Example
//! ```no_run
//! use bookgraph::Config;
//! let config = Config::from_env().expect("failed to load config");
//! println!("Listening on {}:{}", config.api.host, config.api.port);
//! ```

use crate::error::{Error, Result};
use crate::recommendation::fusion::FusionWeights;
use crate::recommendation::similarity::DEFAULT_PARALLEL_THRESHOLD;
use crate::recommendation::store::FallbackStrategy;
use crate::recommendation::vector::{EmbeddingSpace, SpaceDimensions};
use std::time::Duration;
use tracing::info;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database configuration
    pub database: DatabaseConfig,
    /// API server configuration
    pub api: ApiConfig,
    /// Recommendation engine configuration
    pub recommendation: RecommendationConfig,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Minimum connections to keep open
    pub min_connections: u32,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Idle timeout for connections
    pub idle_timeout: Duration,
    /// Maximum lifetime for connections
    pub max_lifetime: Duration,
    /// Prepared statement cache size per connection
    pub statement_cache_size: usize,
    /// Apply pending migrations at startup
    pub run_migrations: bool,
}

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Port to listen on
    pub port: u16,
    /// Host to bind to
    pub host: String,
    /// Request timeout
    pub request_timeout: Duration,
    /// Allowed origins for CORS (`*` for any)
    pub cors_origins: Vec<String>,
    /// Prometheus scrape port (only with the `metrics` feature)
    pub metrics_port: u16,
}

/// Recommendation engine configuration
#[derive(Debug, Clone)]
pub struct RecommendationConfig {
    /// Fusion weights per embedding space
    pub weights: FusionWeights,
    /// Per-space candidate pool is `k * over_fetch_multiplier`
    pub over_fetch_multiplier: usize,
    /// Budget for each space's retrieval
    pub space_timeout: Duration,
    /// Ordering used when hybrid retrieval cannot run
    pub fallback_strategy: FallbackStrategy,
    /// `k` used when the caller gives none
    pub default_limit: usize,
    /// Largest accepted `k`
    pub max_limit: usize,
    /// Pool size from which scoring runs in parallel
    pub parallel_threshold: usize,
    /// Expected vector length per space
    pub dimensions: SpaceDimensions,
}

impl Default for RecommendationConfig {
    fn default() -> Self {
        Self {
            weights: FusionWeights::default(),
            over_fetch_multiplier: 5,
            space_timeout: Duration::from_millis(2000),
            fallback_strategy: FallbackStrategy::Popularity,
            default_limit: 10,
            max_limit: 100,
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
            dimensions: SpaceDimensions::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Try to load .env file (ignore if not found)
        dotenvy::dotenv().ok();

        let config = Self {
            database: DatabaseConfig::from_env()?,
            api: ApiConfig::from_env()?,
            recommendation: RecommendationConfig::from_env()?,
        };

        config.validate()?;
        config.log_summary();

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(Error::InvalidConfig {
                key: "DATABASE_URL",
                message: "database URL cannot be empty".into(),
            });
        }

        if self.database.max_connections < self.database.min_connections {
            return Err(Error::InvalidConfig {
                key: "DB_MAX_CONNECTIONS",
                message: "max_connections must be >= min_connections".into(),
            });
        }

        self.recommendation.validate()
    }

    /// Log configuration summary (without sensitive data)
    fn log_summary(&self) {
        let rec = &self.recommendation;
        info!("Configuration loaded:");
        info!("  Database:");
        info!("    URL: {}", mask_url(&self.database.url));
        info!(
            "    Pool Size: {}-{}",
            self.database.min_connections, self.database.max_connections
        );
        info!("  API:");
        info!("    Listening on: {}:{}", self.api.host, self.api.port);
        info!("  Recommendation:");
        info!(
            "    Weights: content={} collaborative={} graph={}",
            rec.weights.content, rec.weights.collaborative, rec.weights.graph
        );
        info!(
            "    Over-fetch: {}x, space timeout: {:?}, fallback: {}",
            rec.over_fetch_multiplier, rec.space_timeout, rec.fallback_strategy
        );
    }
}

impl DatabaseConfig {
    fn from_env() -> Result<Self> {
        let url = get_env("DATABASE_URL").unwrap_or_else(|_| {
            let user = std::env::var("USER").unwrap_or_else(|_| "postgres".to_string());
            format!("postgres://{}@localhost/bookgraph_dev", user)
        });

        Ok(Self {
            url,
            max_connections: get_env_or("DB_MAX_CONNECTIONS", "20").parse().unwrap_or(20),
            min_connections: get_env_or("DB_MIN_CONNECTIONS", "2").parse().unwrap_or(2),
            connect_timeout: Duration::from_secs(
                get_env_or("DB_CONNECT_TIMEOUT_SECS", "30")
                    .parse()
                    .unwrap_or(30),
            ),
            idle_timeout: Duration::from_secs(
                get_env_or("DB_IDLE_TIMEOUT_SECS", "600")
                    .parse()
                    .unwrap_or(600),
            ),
            max_lifetime: Duration::from_secs(
                get_env_or("DB_MAX_LIFETIME_SECS", "3600")
                    .parse()
                    .unwrap_or(3600),
            ),
            statement_cache_size: get_env_or("DB_STATEMENT_CACHE_SIZE", "100")
                .parse()
                .unwrap_or(100),
            run_migrations: get_env_or("DB_RUN_MIGRATIONS", "true")
                .parse()
                .unwrap_or(true),
        })
    }
}

impl ApiConfig {
    fn from_env() -> Result<Self> {
        Ok(Self {
            port: get_env_or("API_PORT", "8080").parse().unwrap_or(8080),
            host: get_env_or("API_HOST", "0.0.0.0"),
            request_timeout: Duration::from_secs(
                get_env_or("API_REQUEST_TIMEOUT_SECS", "30")
                    .parse()
                    .unwrap_or(30),
            ),
            cors_origins: get_env_or("API_CORS_ORIGINS", "*")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            metrics_port: get_env_or("METRICS_PORT", "9000").parse().unwrap_or(9000),
        })
    }
}

impl RecommendationConfig {
    fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let weights = FusionWeights {
            content: get_env_parsed_or("REC_WEIGHT_CONTENT", defaults.weights.content)?,
            collaborative: get_env_parsed_or(
                "REC_WEIGHT_COLLABORATIVE",
                defaults.weights.collaborative,
            )?,
            graph: get_env_parsed_or("REC_WEIGHT_GRAPH", defaults.weights.graph)?,
        };

        let fallback_strategy = match std::env::var("REC_FALLBACK_STRATEGY") {
            Ok(raw) => raw.parse().map_err(|_| Error::InvalidConfig {
                key: "REC_FALLBACK_STRATEGY",
                message: format!("expected 'popularity' or 'most_recent', got '{}'", raw).into(),
            })?,
            Err(_) => defaults.fallback_strategy,
        };

        Ok(Self {
            weights,
            over_fetch_multiplier: get_env_parsed_or(
                "REC_OVER_FETCH_MULTIPLIER",
                defaults.over_fetch_multiplier,
            )?,
            space_timeout: Duration::from_millis(get_env_parsed_or(
                "REC_SPACE_TIMEOUT_MS",
                defaults.space_timeout.as_millis() as u64,
            )?),
            fallback_strategy,
            default_limit: get_env_parsed_or("REC_DEFAULT_LIMIT", defaults.default_limit)?,
            max_limit: get_env_parsed_or("REC_MAX_LIMIT", defaults.max_limit)?,
            parallel_threshold: get_env_parsed_or(
                "REC_PARALLEL_THRESHOLD",
                defaults.parallel_threshold,
            )?,
            dimensions: SpaceDimensions {
                content: get_env_parsed_or("REC_CONTENT_DIM", defaults.dimensions.content)?,
                collaborative: get_env_parsed_or("REC_CF_DIM", defaults.dimensions.collaborative)?,
                graph: get_env_parsed_or("REC_GRAPH_DIM", defaults.dimensions.graph)?,
            },
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.weights.validate()?;

        if self.over_fetch_multiplier == 0 {
            return Err(Error::InvalidConfig {
                key: "REC_OVER_FETCH_MULTIPLIER",
                message: "must be at least 1".into(),
            });
        }

        if self.space_timeout.is_zero() {
            return Err(Error::InvalidConfig {
                key: "REC_SPACE_TIMEOUT_MS",
                message: "must be greater than zero".into(),
            });
        }

        if self.max_limit == 0 || self.default_limit == 0 || self.default_limit > self.max_limit {
            return Err(Error::InvalidConfig {
                key: "REC_DEFAULT_LIMIT",
                message: "default limit must be within 1..=REC_MAX_LIMIT".into(),
            });
        }

        for space in EmbeddingSpace::ALL {
            if self.dimensions.get(space) == 0 {
                return Err(Error::InvalidConfig {
                    key: "REC_*_DIM",
                    message: format!("{} dimensionality must be positive", space).into(),
                });
            }
        }

        Ok(())
    }
}

// ============================================================================
// Helper functions
// ============================================================================

/// Get required environment variable
fn get_env(key: &'static str) -> Result<String> {
    std::env::var(key).map_err(|_| Error::MissingEnvVar { var: key })
}

/// Get environment variable with default
fn get_env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Parse an optional environment variable; a present but invalid value is an error
fn get_env_parsed_or<T>(key: &'static str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value.trim().parse().map_err(|e: T::Err| Error::InvalidConfig {
            key,
            message: format!("Invalid value '{}': {}", value, e).into(),
        }),
        Err(_) => Ok(default),
    }
}

/// Mask sensitive parts of URL
pub(crate) fn mask_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            // Skip the scheme separator in "postgres://user@host"
            if url[colon_pos..].starts_with("://") {
                return url.to_string();
            }
            return format!("{}****{}", &url[..=colon_pos], &url[at_pos..]);
        }
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_url() {
        assert_eq!(
            mask_url("postgres://reader:s3cret@db:5432/books"),
            "postgres://reader:****@db:5432/books"
        );
        assert_eq!(
            mask_url("postgres://reader@db/books"),
            "postgres://reader@db/books"
        );
        assert_eq!(mask_url("postgres://db/books"), "postgres://db/books");
    }

    #[test]
    fn test_default_recommendation_config_is_valid() {
        assert!(RecommendationConfig::default().validate().is_ok());
    }

    #[test]
    fn test_recommendation_config_rejects_bad_values() {
        let mut config = RecommendationConfig::default();
        config.over_fetch_multiplier = 0;
        assert!(config.validate().is_err());

        let mut config = RecommendationConfig::default();
        config.weights.graph = -1.0;
        assert!(config.validate().is_err());

        let mut config = RecommendationConfig::default();
        config.default_limit = 500;
        assert!(config.validate().is_err());
    }
}
