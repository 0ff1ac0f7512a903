use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

use crate::capture::delay::{DelayPolicy, DEFAULT_CAPTURE_BUFFER_SECS, EDIT_WINDOW_SECS};
use crate::capture::lock::DEFAULT_LOCK_TTL_SECS;
use crate::capture::queue::{RetryPolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_BACKOFF_MS};
use crate::capture::redis_queue::DEFAULT_NAMESPACE;
use crate::capture::worker::{
    WorkerSettings, DEFAULT_POLL_INTERVAL_MS, DEFAULT_STALL_TIMEOUT_SECS,
    DEFAULT_WORKER_CONCURRENCY,
};
use crate::services::payments::{GatewayConfig, DEFAULT_GATEWAY_URL};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_GATEWAY_TIMEOUT_MS: u64 = 15_000;

/// Plain environment variables honoured alongside the `APP__*` layer.
const REDIS_URL_ENV: &str = "REDIS_URL";
const CAPTURE_BUFFER_ENV: &str = "CAPTURE_BUFFER_SECONDS";

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Maximum database pool size
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// Capture queue backend; unset or blank disables the capture worker
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Seconds subtracted from the one-hour edit window before capture
    #[serde(default = "default_capture_buffer_seconds")]
    #[validate(range(min = 0, max = 3600))]
    pub capture_buffer_seconds: u64,

    /// Key prefix for the capture queue
    #[serde(default = "default_capture_queue_namespace")]
    #[validate(length(min = 1))]
    pub capture_queue_namespace: String,

    #[serde(default = "default_capture_worker_concurrency")]
    #[validate(range(min = 1, max = 256))]
    pub capture_worker_concurrency: usize,

    #[serde(default = "default_capture_poll_interval_ms")]
    #[validate(range(min = 10))]
    pub capture_poll_interval_ms: u64,

    #[serde(default = "default_capture_max_attempts")]
    #[validate(range(min = 1, max = 100))]
    pub capture_max_attempts: u32,

    #[serde(default = "default_capture_retry_backoff_ms")]
    pub capture_retry_backoff_ms: u64,

    /// Age after which a capture lock is considered abandoned
    #[serde(default = "default_capture_lock_ttl_secs")]
    #[validate(range(min = 1))]
    pub capture_lock_ttl_secs: u64,

    /// Age after which an active job with no result is requeued
    #[serde(default = "default_capture_stall_timeout_secs")]
    #[validate(range(min = 1))]
    pub capture_stall_timeout_secs: u64,

    #[serde(default = "default_payment_gateway_url")]
    #[validate(url)]
    pub payment_gateway_url: String,

    #[serde(default)]
    pub payment_gateway_api_key: Option<String>,

    #[serde(default = "default_payment_gateway_timeout_ms")]
    #[validate(range(min = 1))]
    pub payment_gateway_timeout_ms: u64,
}

impl AppConfig {
    /// Creates a configuration with every optional field at its default.
    pub fn new(database_url: String, host: String, port: u16, environment: String) -> Self {
        Self {
            database_url,
            db_max_connections: default_db_max_connections(),
            redis_url: None,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            capture_buffer_seconds: default_capture_buffer_seconds(),
            capture_queue_namespace: default_capture_queue_namespace(),
            capture_worker_concurrency: default_capture_worker_concurrency(),
            capture_poll_interval_ms: default_capture_poll_interval_ms(),
            capture_max_attempts: default_capture_max_attempts(),
            capture_retry_backoff_ms: default_capture_retry_backoff_ms(),
            capture_lock_ttl_secs: default_capture_lock_ttl_secs(),
            capture_stall_timeout_secs: default_capture_stall_timeout_secs(),
            payment_gateway_url: default_payment_gateway_url(),
            payment_gateway_api_key: None,
            payment_gateway_timeout_ms: default_payment_gateway_timeout_ms(),
        }
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    /// Queue URL, if one is configured and non-blank.
    pub fn redis_url(&self) -> Option<&str> {
        self.redis_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    pub fn delay_policy(&self) -> DelayPolicy {
        DelayPolicy::new(self.capture_buffer_seconds)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.capture_max_attempts,
            backoff: Duration::from_millis(self.capture_retry_backoff_ms),
        }
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.capture_lock_ttl_secs)
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            concurrency: self.capture_worker_concurrency,
            poll_interval: Duration::from_millis(self.capture_poll_interval_ms),
            stall_timeout: Duration::from_secs(self.capture_stall_timeout_secs),
        }
    }

    /// Gateway settings; `None` without an API key.
    pub fn gateway_config(&self) -> Option<GatewayConfig> {
        let secret_key = self
            .payment_gateway_api_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())?;
        Some(GatewayConfig {
            base_url: self.payment_gateway_url.clone(),
            secret_key: secret_key.to_string(),
            timeout: Duration::from_millis(self.payment_gateway_timeout_ms),
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_db_max_connections() -> u32 {
    16
}

fn default_capture_buffer_seconds() -> u64 {
    DEFAULT_CAPTURE_BUFFER_SECS
}

fn default_capture_queue_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_capture_worker_concurrency() -> usize {
    DEFAULT_WORKER_CONCURRENCY
}

fn default_capture_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_capture_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_capture_retry_backoff_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF_MS
}

fn default_capture_lock_ttl_secs() -> u64 {
    DEFAULT_LOCK_TTL_SECS
}

fn default_capture_stall_timeout_secs() -> u64 {
    DEFAULT_STALL_TIMEOUT_SECS
}

fn default_payment_gateway_url() -> String {
    DEFAULT_GATEWAY_URL.to_string()
}

fn default_payment_gateway_timeout_ms() -> u64 {
    DEFAULT_GATEWAY_TIMEOUT_MS
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("capture_scheduler={},tower_http=info", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. `REDIS_URL` / `CAPTURE_BUFFER_SECONDS`, unless the `APP__` form is set
/// 5. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    load_config_from(Path::new(CONFIG_DIR))
}

/// Same as [`load_config`] with an explicit config directory.
pub fn load_config_from(config_dir: &Path) -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !config_dir.exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            config_dir.display()
        );
    }

    let mut builder = Config::builder()
        .set_default("database_url", "sqlite://capture_scheduler.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::from(config_dir.join("default")).required(false))
        .add_source(File::from(config_dir.join(&run_env)).required(false));

    if env::var("APP__REDIS_URL").is_err() {
        if let Ok(url) = env::var(REDIS_URL_ENV) {
            builder = builder.set_override("redis_url", url)?;
        }
    }
    if env::var("APP__CAPTURE_BUFFER_SECONDS").is_err() {
        if let Ok(raw) = env::var(CAPTURE_BUFFER_ENV) {
            let buffer = parse_buffer_seconds(&raw)?;
            builder = builder.set_override("capture_buffer_seconds", buffer as i64)?;
        }
    }

    let config = builder
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

fn parse_buffer_seconds(raw: &str) -> Result<u64, AppConfigError> {
    raw.trim()
        .parse::<u64>()
        .ok()
        .filter(|secs| *secs <= EDIT_WINDOW_SECS)
        .ok_or_else(|| AppConfigError::InvalidEnv {
            name: CAPTURE_BUFFER_ENV,
            value: raw.to_string(),
        })
}
