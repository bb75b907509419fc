//! Service configuration.
//!
//! [`CollectConfig`] gathers the settings of every subsystem. Values start
//! from [`Default`] and are overridden by `COLLECT_*` environment variables
//! plus the conventional `DATABASE_URL` and `REDIS_URL`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::auth::{AuthConfig, CacheFailurePolicy};
use crate::scheduler::{QueueConfig, WorkerPoolConfig};
use crate::storage::RetentionPolicy;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// HTTP listener settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiConfig {
    pub listen_addr: SocketAddr,
    /// Largest accepted request body in bytes.
    pub max_request_size: usize,
    pub request_timeout: Duration,
    /// Deadline for handing an accepted inventory to the queue.
    pub enqueue_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8081)),
            max_request_size: 10 * 1024 * 1024,
            request_timeout: Duration::from_secs(30),
            enqueue_timeout: Duration::from_secs(5),
        }
    }
}

/// Shared store connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RedisConfig {
    pub url: String,
    /// Logical database selected after connecting.
    pub db: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            db: 1,
        }
    }
}

/// Worker pool sizes and timings.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub inventory_workers: usize,
    pub processing_workers: usize,
    pub notification_workers: usize,
    pub poll_timeout: Duration,
    pub job_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            inventory_workers: 5,
            processing_workers: 3,
            notification_workers: 2,
            poll_timeout: Duration::from_secs(1),
            job_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    /// Pool configuration for `num_workers` workers with the shared timings.
    pub fn pool(&self, num_workers: usize) -> WorkerPoolConfig {
        WorkerPoolConfig::new(num_workers)
            .with_poll_timeout(self.poll_timeout)
            .with_job_timeout(self.job_timeout)
            .with_shutdown_timeout(self.shutdown_timeout)
    }
}

/// Periodic task intervals.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleConfig {
    pub reaper_interval: Duration,
    pub health_check_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            reaper_interval: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(600),
        }
    }
}

/// Data retention settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionConfig {
    pub inventory_max_age: Duration,
    pub cleanup_interval: Duration,
    pub keep_latest: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            inventory_max_age: Duration::from_secs(90 * 24 * 3600),
            cleanup_interval: Duration::from_secs(6 * 3600),
            keep_latest: 10,
        }
    }
}

impl RetentionConfig {
    pub fn policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_age: chrono::Duration::from_std(self.inventory_max_age)
                .unwrap_or_else(|_| chrono::Duration::days(90)),
            keep_latest: self.keep_latest,
            ..RetentionPolicy::default()
        }
    }
}

/// Change-detection settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DifferConfig {
    /// YAML rules file; built-in rules when unset.
    pub rules_path: Option<PathBuf>,
    /// Overrides the depth limit of the loaded rules.
    pub max_diff_depth: Option<usize>,
}

/// Complete service configuration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CollectConfig {
    pub api: ApiConfig,
    /// Postgres URL; required unless running on in-memory storage.
    pub database_url: Option<String>,
    pub redis: RedisConfig,
    pub auth: AuthConfig,
    pub queue: QueueConfig,
    pub workers: WorkerConfig,
    pub schedule: ScheduleConfig,
    pub retention: RetentionConfig,
    pub differ: DifferConfig,
}

impl CollectConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `COLLECT_LISTEN_ADDR`: Listen address (default: 127.0.0.1:8081)
    /// - `COLLECT_MAX_REQUEST_SIZE`: Body limit in bytes (default: 10 MB)
    /// - `COLLECT_REQUEST_TIMEOUT_SECS`: Request timeout (default: 30)
    /// - `DATABASE_URL`: Postgres connection URL
    /// - `REDIS_URL`: Redis URL (default: redis://localhost:6379)
    /// - `COLLECT_REDIS_DB`: Redis database (default: 1)
    /// - `COLLECT_SECRET_PREFIX`: Public part prefix (default: my_)
    /// - `COLLECT_MIN_SECRET_LENGTH`: Minimum secret part length (default: 32)
    /// - `COLLECT_AUTH_CACHE_TTL_SECS`: Positive verdict TTL (default: 300)
    /// - `COLLECT_AUTH_NEGATIVE_TTL_SECS`: Negative verdict TTL (default: 60)
    /// - `COLLECT_AUTH_CACHE_FAIL_CLOSED`: Refuse auth when the cache is down (default: false)
    /// - `COLLECT_QUEUE_INVENTORY`, `COLLECT_QUEUE_PROCESSING`, `COLLECT_QUEUE_NOTIFICATION`: Queue names
    /// - `COLLECT_RETRY_ATTEMPTS`: Attempts for inventory/processing (default: 3)
    /// - `COLLECT_NOTIFICATION_RETRY_ATTEMPTS`: Attempts for notifications (default: 3)
    /// - `COLLECT_RETRY_DELAY_SECS`: Base retry delay (default: 5)
    /// - `COLLECT_BATCH_SIZE`: Delayed messages moved per pass (default: 10)
    /// - `COLLECT_MAX_QUEUE_DEPTH`: Nominal queue capacity (default: 10000)
    /// - `COLLECT_BACKPRESSURE_THRESHOLD`: Fraction of capacity (default: 0.8)
    /// - `COLLECT_BREAKER_THRESHOLD`: Failures that open a breaker (default: 5)
    /// - `COLLECT_BREAKER_TIMEOUT_SECS`: Open breaker duration (default: 30)
    /// - `COLLECT_INVENTORY_WORKERS`, `COLLECT_PROCESSING_WORKERS`, `COLLECT_NOTIFICATION_WORKERS`: Pool sizes (default: 5/3/2)
    /// - `COLLECT_JOB_TIMEOUT_SECS`: Handler timeout (default: 60)
    /// - `COLLECT_SHUTDOWN_TIMEOUT_SECS`: Graceful shutdown limit (default: 30)
    /// - `COLLECT_REAPER_INTERVAL_SECS`: Delayed reaper interval (default: 30)
    /// - `COLLECT_HEALTH_CHECK_INTERVAL_SECS`: Health monitor interval (default: 30)
    /// - `COLLECT_HEARTBEAT_TIMEOUT_SECS`: Stale heartbeat threshold (default: 600)
    /// - `COLLECT_INVENTORY_MAX_AGE_DAYS`: Retention age (default: 90)
    /// - `COLLECT_CLEANUP_INTERVAL_SECS`: Retention interval (default: 21600)
    /// - `COLLECT_DIFFER_RULES`: YAML rules file
    /// - `COLLECT_MAX_DIFF_DEPTH`: Diff depth limit (default: 10)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the result
    /// fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) but reads variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let secs = |key: &str| -> Result<Option<Duration>, ConfigError> {
            lookup(key)
                .map(|v| parse_env_value::<u64>(&v, key).map(Duration::from_secs))
                .transpose()
        };
        let value = |key: &str| lookup(key);

        // API
        if let Some(val) = value("COLLECT_LISTEN_ADDR") {
            config.api.listen_addr = parse_env_value(&val, "COLLECT_LISTEN_ADDR")?;
        }
        if let Some(val) = value("COLLECT_MAX_REQUEST_SIZE") {
            config.api.max_request_size = parse_env_value(&val, "COLLECT_MAX_REQUEST_SIZE")?;
        }
        if let Some(d) = secs("COLLECT_REQUEST_TIMEOUT_SECS")? {
            config.api.request_timeout = d;
        }

        // Storage
        config.database_url = value("DATABASE_URL").filter(|v| !v.is_empty());
        if let Some(val) = value("REDIS_URL") {
            config.redis.url = val;
        }
        if let Some(val) = value("COLLECT_REDIS_DB") {
            config.redis.db = parse_env_value(&val, "COLLECT_REDIS_DB")?;
        }

        // Authentication
        if let Some(val) = value("COLLECT_SECRET_PREFIX") {
            config.auth.secret_prefix = val;
        }
        if let Some(val) = value("COLLECT_MIN_SECRET_LENGTH") {
            config.auth.min_secret_length = parse_env_value(&val, "COLLECT_MIN_SECRET_LENGTH")?;
        }
        if let Some(d) = secs("COLLECT_AUTH_CACHE_TTL_SECS")? {
            config.auth.cache_ttl = d;
        }
        if let Some(d) = secs("COLLECT_AUTH_NEGATIVE_TTL_SECS")? {
            config.auth.negative_cache_ttl = d;
        }
        if let Some(val) = value("COLLECT_AUTH_CACHE_FAIL_CLOSED") {
            if parse_env_bool(&val, "COLLECT_AUTH_CACHE_FAIL_CLOSED")? {
                config.auth.cache_policy = CacheFailurePolicy::FailClosed;
            }
        }

        // Queues
        if let Some(val) = value("COLLECT_QUEUE_INVENTORY") {
            config.queue.inventory_queue = val;
        }
        if let Some(val) = value("COLLECT_QUEUE_PROCESSING") {
            config.queue.processing_queue = val;
        }
        if let Some(val) = value("COLLECT_QUEUE_NOTIFICATION") {
            config.queue.notification_queue = val;
        }
        if let Some(val) = value("COLLECT_RETRY_ATTEMPTS") {
            config.queue.retry_attempts = parse_env_value(&val, "COLLECT_RETRY_ATTEMPTS")?;
        }
        if let Some(val) = value("COLLECT_NOTIFICATION_RETRY_ATTEMPTS") {
            config.queue.notification_retry_attempts =
                parse_env_value(&val, "COLLECT_NOTIFICATION_RETRY_ATTEMPTS")?;
        }
        if let Some(d) = secs("COLLECT_RETRY_DELAY_SECS")? {
            config.queue.retry_delay = d;
        }
        if let Some(val) = value("COLLECT_BATCH_SIZE") {
            config.queue.batch_size = parse_env_value(&val, "COLLECT_BATCH_SIZE")?;
        }
        if let Some(val) = value("COLLECT_MAX_QUEUE_DEPTH") {
            config.queue.max_queue_depth = parse_env_value(&val, "COLLECT_MAX_QUEUE_DEPTH")?;
        }
        if let Some(val) = value("COLLECT_BACKPRESSURE_THRESHOLD") {
            config.queue.backpressure_threshold =
                parse_env_value(&val, "COLLECT_BACKPRESSURE_THRESHOLD")?;
        }
        if let Some(val) = value("COLLECT_BREAKER_THRESHOLD") {
            config.queue.breaker.failure_threshold =
                parse_env_value(&val, "COLLECT_BREAKER_THRESHOLD")?;
        }
        if let Some(d) = secs("COLLECT_BREAKER_TIMEOUT_SECS")? {
            config.queue.breaker.open_timeout = d;
        }

        // Workers
        if let Some(val) = value("COLLECT_INVENTORY_WORKERS") {
            config.workers.inventory_workers = parse_env_value(&val, "COLLECT_INVENTORY_WORKERS")?;
        }
        if let Some(val) = value("COLLECT_PROCESSING_WORKERS") {
            config.workers.processing_workers =
                parse_env_value(&val, "COLLECT_PROCESSING_WORKERS")?;
        }
        if let Some(val) = value("COLLECT_NOTIFICATION_WORKERS") {
            config.workers.notification_workers =
                parse_env_value(&val, "COLLECT_NOTIFICATION_WORKERS")?;
        }
        if let Some(d) = secs("COLLECT_JOB_TIMEOUT_SECS")? {
            config.workers.job_timeout = d;
        }
        if let Some(d) = secs("COLLECT_SHUTDOWN_TIMEOUT_SECS")? {
            config.workers.shutdown_timeout = d;
        }

        // Background tasks
        if let Some(d) = secs("COLLECT_REAPER_INTERVAL_SECS")? {
            config.schedule.reaper_interval = d;
        }
        if let Some(d) = secs("COLLECT_HEALTH_CHECK_INTERVAL_SECS")? {
            config.schedule.health_check_interval = d;
        }
        if let Some(d) = secs("COLLECT_HEARTBEAT_TIMEOUT_SECS")? {
            config.schedule.heartbeat_timeout = d;
        }
        if let Some(val) = value("COLLECT_INVENTORY_MAX_AGE_DAYS") {
            let days: u64 = parse_env_value(&val, "COLLECT_INVENTORY_MAX_AGE_DAYS")?;
            config.retention.inventory_max_age = Duration::from_secs(days * 24 * 3600);
        }
        if let Some(d) = secs("COLLECT_CLEANUP_INTERVAL_SECS")? {
            config.retention.cleanup_interval = d;
        }

        // Change detection
        if let Some(val) = value("COLLECT_DIFFER_RULES") {
            config.differ.rules_path = Some(PathBuf::from(val));
        }
        if let Some(val) = value("COLLECT_MAX_DIFF_DEPTH") {
            config.differ.max_diff_depth = Some(parse_env_value(&val, "COLLECT_MAX_DIFF_DEPTH")?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.max_request_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_request_size must be greater than 0".to_string(),
            ));
        }

        if self.redis.url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis url cannot be empty".to_string(),
            ));
        }

        if self.auth.min_secret_length == 0 {
            return Err(ConfigError::ValidationFailed(
                "min_secret_length must be greater than 0".to_string(),
            ));
        }

        if self.queue.retry_attempts == 0 || self.queue.notification_retry_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "retry_attempts must be greater than 0".to_string(),
            ));
        }

        if self.queue.batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "batch_size must be greater than 0".to_string(),
            ));
        }

        if !(self.queue.backpressure_threshold > 0.0 && self.queue.backpressure_threshold <= 1.0)
        {
            return Err(ConfigError::ValidationFailed(
                "backpressure_threshold must be in (0.0, 1.0]".to_string(),
            ));
        }

        let names = [
            &self.queue.inventory_queue,
            &self.queue.processing_queue,
            &self.queue.notification_queue,
        ];
        if names.iter().any(|n| n.is_empty())
            || names[0] == names[1]
            || names[1] == names[2]
            || names[0] == names[2]
        {
            return Err(ConfigError::ValidationFailed(
                "queue names must be non-empty and distinct".to_string(),
            ));
        }

        let workers = &self.workers;
        if workers.inventory_workers == 0
            || workers.processing_workers == 0
            || workers.notification_workers == 0
        {
            return Err(ConfigError::ValidationFailed(
                "every worker pool needs at least one worker".to_string(),
            ));
        }

        for (name, interval) in [
            ("reaper_interval", self.schedule.reaper_interval),
            ("health_check_interval", self.schedule.health_check_interval),
            ("cleanup_interval", self.retention.cleanup_interval),
            ("job_timeout", workers.job_timeout),
        ] {
            if interval.is_zero() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if self.differ.max_diff_depth == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "max_diff_depth must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// The Postgres URL, required outside in-memory mode.
    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
