use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::Validate;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";

const DEFAULT_PAYMENT_WINDOW_SECS: u64 = 600;
const DEFAULT_SAGA_STEP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SAGA_RUN_TIMEOUT_SECS: u64 = 60;
const DEFAULT_SAGA_MAX_RETRIES: u32 = 3;
const DEFAULT_QUEUE_PASS_TTL_SECS: u64 = 300;
const DEFAULT_QUEUE_RELEASE_INTERVAL_SECS: u64 = 1;
const DEFAULT_QUEUE_STREAM_MAX_SECS: u64 = 900;
const DEFAULT_EXPIRY_SCAN_INTERVAL_SECS: u64 = 60;
const DEFAULT_INVENTORY_SYNC_INTERVAL_SECS: u64 = 5;
const DEFAULT_OUTBOX_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

/// Per-endpoint token bucket settings.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct RateLimitConfig {
    /// Steady-state refill rate, tokens per second.
    #[serde(default = "default_rl_rate")]
    pub default_rate_per_sec: u32,
    /// Bucket capacity (burst size).
    #[serde(default = "default_rl_burst")]
    pub default_burst: u32,
    /// Refill rate for POST /bookings/reserve.
    #[serde(default = "default_rl_reserve_rate")]
    pub reserve_rate_per_sec: u32,
    /// Burst for POST /bookings/reserve.
    #[serde(default = "default_rl_reserve_burst")]
    pub reserve_burst: u32,
    /// Redis namespace for distributed buckets.
    #[serde(default = "default_rl_namespace")]
    pub namespace: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_rate_per_sec: default_rl_rate(),
            default_burst: default_rl_burst(),
            reserve_rate_per_sec: default_rl_reserve_rate(),
            reserve_burst: default_rl_reserve_burst(),
            namespace: default_rl_namespace(),
        }
    }
}

/// Application configuration with validation.
///
/// Sources are layered: `config/default.toml`, then `config/{env}.toml`,
/// then `APP__*` environment variables.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Durable store connection URL (Postgres in production, SQLite in dev).
    pub database_url: String,

    /// Redis connection URL (inventory store, queue, pub/sub).
    pub redis_url: String,

    /// Secret used to validate bearer tokens issued by the auth service.
    #[validate(length(min = 32))]
    pub jwt_secret: String,

    /// Secret used to sign queue bypass tokens.
    #[validate(length(min = 32))]
    pub queue_pass_secret: String,

    /// Server host address.
    pub host: String,

    /// Server port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment (development, staging, production).
    pub environment: String,

    /// Logging level.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format.
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup.
    #[serde(default)]
    pub auto_migrate: bool,

    /// Payment window: how long a reservation is held before expiring.
    #[serde(default = "default_payment_window_secs")]
    pub payment_window_secs: u64,

    /// Per-step saga timeout.
    #[serde(default = "default_saga_step_timeout_secs")]
    pub saga_step_timeout_secs: u64,

    /// Whole-run saga timeout.
    #[serde(default = "default_saga_run_timeout_secs")]
    pub saga_run_timeout_secs: u64,

    /// Retry budget for retryable saga step failures.
    #[serde(default = "default_saga_max_retries")]
    pub saga_max_retries: u32,

    /// Queue bypass token TTL.
    #[serde(default = "default_queue_pass_ttl_secs")]
    pub queue_pass_ttl_secs: u64,

    /// Queue release worker tick interval.
    #[serde(default = "default_queue_release_interval_secs")]
    pub queue_release_interval_secs: u64,

    /// Server-side cutoff for an open queue position stream.
    #[serde(default = "default_queue_stream_max_secs")]
    pub queue_stream_max_secs: u64,

    /// Expiry worker scan interval.
    #[serde(default = "default_expiry_scan_interval_secs")]
    pub expiry_scan_interval_secs: u64,

    /// Inventory sync worker batch interval.
    #[serde(default = "default_inventory_sync_interval_secs")]
    pub inventory_sync_interval_secs: u64,

    /// Outbox publisher poll interval.
    #[serde(default = "default_outbox_poll_interval_ms")]
    pub outbox_poll_interval_ms: u64,

    /// Message queue backend: "in-memory" or "redis".
    #[serde(default = "default_mq_backend")]
    pub mq_backend: String,

    /// Namespace prefix for Redis-backed message queues.
    #[serde(default = "default_mq_namespace")]
    pub mq_namespace: String,

    /// Per-request deadline applied at the HTTP edge.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Rate limiter settings.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// DB pool: max connections.
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections.
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB connect timeout (seconds).
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,

    /// DB acquire timeout (seconds).
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,
}

fn default_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_payment_window_secs() -> u64 {
    DEFAULT_PAYMENT_WINDOW_SECS
}
fn default_saga_step_timeout_secs() -> u64 {
    DEFAULT_SAGA_STEP_TIMEOUT_SECS
}
fn default_saga_run_timeout_secs() -> u64 {
    DEFAULT_SAGA_RUN_TIMEOUT_SECS
}
fn default_saga_max_retries() -> u32 {
    DEFAULT_SAGA_MAX_RETRIES
}
fn default_queue_pass_ttl_secs() -> u64 {
    DEFAULT_QUEUE_PASS_TTL_SECS
}
fn default_queue_release_interval_secs() -> u64 {
    DEFAULT_QUEUE_RELEASE_INTERVAL_SECS
}
fn default_queue_stream_max_secs() -> u64 {
    DEFAULT_QUEUE_STREAM_MAX_SECS
}
fn default_expiry_scan_interval_secs() -> u64 {
    DEFAULT_EXPIRY_SCAN_INTERVAL_SECS
}
fn default_inventory_sync_interval_secs() -> u64 {
    DEFAULT_INVENTORY_SYNC_INTERVAL_SECS
}
fn default_outbox_poll_interval_ms() -> u64 {
    DEFAULT_OUTBOX_POLL_INTERVAL_MS
}
fn default_mq_backend() -> String {
    "in-memory".to_string()
}
fn default_mq_namespace() -> String {
    "bookrush:mq".to_string()
}
fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}
fn default_rl_rate() -> u32 {
    100
}
fn default_rl_burst() -> u32 {
    200
}
fn default_rl_reserve_rate() -> u32 {
    50
}
fn default_rl_reserve_burst() -> u32 {
    100
}
fn default_rl_namespace() -> String {
    "bookrush:rl".to_string()
}
fn default_db_max_connections() -> u32 {
    50
}
fn default_db_min_connections() -> u32 {
    5
}
fn default_db_connect_timeout_secs() -> u64 {
    10
}
fn default_db_acquire_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("configuration load error: {0}")]
    Load(#[from] ConfigError),
    #[error("configuration validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Initializes the tracing subscriber from the configured level.
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::fmt;

    let default_directive = format!("bookrush_api={},tower_http=info", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt().with_env_filter(filter_directive).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter_directive).try_init();
    }
}

/// Loads application configuration.
///
/// Layers configuration sources in this order:
/// 1. Default config (config/default.toml)
/// 2. Environment-specific config (config/{env}.toml)
/// 3. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    // jwt_secret and queue_pass_secret have no defaults - they MUST come
    // from a config file or environment variable.
    let builder = Config::builder()
        .set_default("database_url", "sqlite://bookrush.db?mode=rwc")?
        .set_default("redis_url", "redis://localhost:6379")?
        .set_default("host", "0.0.0.0")?
        .set_default("environment", DEFAULT_ENV)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false));

    let config = builder
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    for secret in ["jwt_secret", "queue_pass_secret"] {
        if config.get_string(secret).is_err() {
            error!(
                "{} is not configured. Set APP__{} with a secure random string (minimum 32 characters).",
                secret,
                secret.to_uppercase()
            );
            return Err(AppConfigError::Load(ConfigError::NotFound(format!(
                "{} is required but not configured",
                secret
            ))));
        }
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> AppConfig {
        AppConfig {
            database_url: "sqlite::memory:".into(),
            redis_url: "redis://localhost:6379".into(),
            jwt_secret: "0123456789abcdef0123456789abcdef".into(),
            queue_pass_secret: "fedcba9876543210fedcba9876543210".into(),
            host: "127.0.0.1".into(),
            port: default_port(),
            environment: "test".into(),
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            payment_window_secs: default_payment_window_secs(),
            saga_step_timeout_secs: default_saga_step_timeout_secs(),
            saga_run_timeout_secs: default_saga_run_timeout_secs(),
            saga_max_retries: default_saga_max_retries(),
            queue_pass_ttl_secs: default_queue_pass_ttl_secs(),
            queue_release_interval_secs: default_queue_release_interval_secs(),
            queue_stream_max_secs: default_queue_stream_max_secs(),
            expiry_scan_interval_secs: default_expiry_scan_interval_secs(),
            inventory_sync_interval_secs: default_inventory_sync_interval_secs(),
            outbox_poll_interval_ms: default_outbox_poll_interval_ms(),
            mq_backend: default_mq_backend(),
            mq_namespace: default_mq_namespace(),
            request_timeout_secs: default_request_timeout_secs(),
            rate_limit: RateLimitConfig::default(),
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
        }
    }

    #[test]
    fn defaults_match_spec_windows() {
        let cfg = minimal_config();
        assert_eq!(cfg.payment_window_secs, 600);
        assert_eq!(cfg.saga_step_timeout_secs, 30);
        assert_eq!(cfg.saga_run_timeout_secs, 60);
        assert_eq!(cfg.queue_pass_ttl_secs, 300);
        assert_eq!(cfg.queue_release_interval_secs, 1);
        assert_eq!(cfg.expiry_scan_interval_secs, 60);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn short_secrets_fail_validation() {
        let mut cfg = minimal_config();
        cfg.jwt_secret = "too-short".into();
        assert!(cfg.validate().is_err());
    }
}
