//! Runtime configuration.
//!
//! All settings have defaults and can be overridden through `BANANAS_*`
//! environment variables:
//!
//! - `BANANAS_REDIS_URL`: Redis connection URL (default: redis://127.0.0.1:6379)
//! - `BANANAS_KEY_PREFIX`: Prefix of every store key (default: bananas)
//! - `BANANAS_WORKERS`: Workers per pool (default: 4)
//! - `BANANAS_ROUTING_KEYS`: Comma-separated routes served (default: default)
//! - `BANANAS_DEQUEUE_TIMEOUT_MS`: Longest single blocking claim (default: 1000)
//! - `BANANAS_JOB_TIMEOUT_SECS`: Handler deadline when none is registered (default: 300)
//! - `BANANAS_MAX_RETRIES`: Retry budget for new jobs (default: 3)
//! - `BANANAS_SUCCESS_TTL_SECS`: Lifetime of successful results (default: 3600)
//! - `BANANAS_FAILURE_TTL_SECS`: Lifetime of failed results (default: 86400)
//! - `BANANAS_TICK_INTERVAL_MS`: Scheduler tick interval (default: 1000)
//! - `BANANAS_LOCK_TTL_MS`: Scheduler lease TTL (default: 5000)
//! - `BANANAS_VISIBILITY_TIMEOUT_SECS`: Age at which processing jobs are reclaimed (default: 1800)
//! - `BANANAS_REAP_INTERVAL_SECS`: Time between processing-list sweeps (default: 30)
//! - `BANANAS_MAX_BACKOFF_SECS`: Cap on retry delay (default: none)
//! - `BANANAS_SHUTDOWN_TIMEOUT_SECS`: Graceful shutdown budget (default: 60)
//! - `BANANAS_SCHEDULES_FILE`: YAML file with cron schedules (default: none)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::dispatcher::{HandlerRegistry, WorkerPoolConfig, DEFAULT_JOB_TIMEOUT};
use crate::keys::{KeySpace, DEFAULT_PREFIX, DEFAULT_ROUTE};
use crate::queue::{JobQueue, RetryPolicy, DEFAULT_MAX_RETRIES};
use crate::results::{DEFAULT_FAILURE_TTL, DEFAULT_SUCCESS_TTL};
use crate::scheduler::{SchedulerConfig, DEFAULT_VISIBILITY_TIMEOUT};
use crate::store::Store;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    // Store settings
    pub redis_url: String,
    pub key_prefix: String,

    // Dispatcher settings
    pub workers: usize,
    pub routing_keys: Vec<String>,
    pub dequeue_timeout: Duration,
    pub default_job_timeout: Duration,
    pub shutdown_timeout: Duration,

    // Retry and result settings
    pub max_retries: u32,
    pub max_backoff: Option<Duration>,
    pub success_ttl: Duration,
    pub failure_ttl: Duration,

    // Scheduler settings
    pub tick_interval: Duration,
    pub lock_ttl: Duration,
    pub visibility_timeout: Duration,
    pub reap_interval: Duration,
    pub schedules_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: DEFAULT_PREFIX.to_string(),
            workers: 4,
            routing_keys: vec![DEFAULT_ROUTE.to_string()],
            dequeue_timeout: Duration::from_secs(1),
            default_job_timeout: DEFAULT_JOB_TIMEOUT,
            shutdown_timeout: Duration::from_secs(60),
            max_retries: DEFAULT_MAX_RETRIES,
            max_backoff: None,
            success_ttl: DEFAULT_SUCCESS_TTL,
            failure_ttl: DEFAULT_FAILURE_TTL,
            tick_interval: Duration::from_secs(1),
            lock_ttl: Duration::from_secs(5),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            reap_interval: Duration::from_secs(30),
            schedules_file: None,
        }
    }
}

impl Config {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable cannot be parsed or the resulting
    /// configuration is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        // Store settings
        if let Some(val) = lookup("BANANAS_REDIS_URL") {
            config.redis_url = val;
        }

        if let Some(val) = lookup("BANANAS_KEY_PREFIX") {
            config.key_prefix = val;
        }

        // Dispatcher settings
        if let Some(val) = lookup("BANANAS_WORKERS") {
            config.workers = parse_env_value(&val, "BANANAS_WORKERS")?;
        }

        if let Some(val) = lookup("BANANAS_ROUTING_KEYS") {
            config.routing_keys = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Some(val) = lookup("BANANAS_DEQUEUE_TIMEOUT_MS") {
            let ms: u64 = parse_env_value(&val, "BANANAS_DEQUEUE_TIMEOUT_MS")?;
            config.dequeue_timeout = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("BANANAS_JOB_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "BANANAS_JOB_TIMEOUT_SECS")?;
            config.default_job_timeout = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("BANANAS_SHUTDOWN_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "BANANAS_SHUTDOWN_TIMEOUT_SECS")?;
            config.shutdown_timeout = Duration::from_secs(secs);
        }

        // Retry and result settings
        if let Some(val) = lookup("BANANAS_MAX_RETRIES") {
            config.max_retries = parse_env_value(&val, "BANANAS_MAX_RETRIES")?;
        }

        if let Some(val) = lookup("BANANAS_MAX_BACKOFF_SECS") {
            let secs: u64 = parse_env_value(&val, "BANANAS_MAX_BACKOFF_SECS")?;
            config.max_backoff = Some(Duration::from_secs(secs));
        }

        if let Some(val) = lookup("BANANAS_SUCCESS_TTL_SECS") {
            let secs: u64 = parse_env_value(&val, "BANANAS_SUCCESS_TTL_SECS")?;
            config.success_ttl = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("BANANAS_FAILURE_TTL_SECS") {
            let secs: u64 = parse_env_value(&val, "BANANAS_FAILURE_TTL_SECS")?;
            config.failure_ttl = Duration::from_secs(secs);
        }

        // Scheduler settings
        if let Some(val) = lookup("BANANAS_TICK_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "BANANAS_TICK_INTERVAL_MS")?;
            config.tick_interval = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("BANANAS_LOCK_TTL_MS") {
            let ms: u64 = parse_env_value(&val, "BANANAS_LOCK_TTL_MS")?;
            config.lock_ttl = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("BANANAS_VISIBILITY_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "BANANAS_VISIBILITY_TIMEOUT_SECS")?;
            config.visibility_timeout = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("BANANAS_REAP_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "BANANAS_REAP_INTERVAL_SECS")?;
            config.reap_interval = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("BANANAS_SCHEDULES_FILE") {
            config.schedules_file = Some(PathBuf::from(val));
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// Success and failure TTLs are independent; only non-zero is required.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_prefix.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "key_prefix cannot be empty".to_string(),
            ));
        }

        if self.workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "workers must be greater than 0".to_string(),
            ));
        }

        if self.routing_keys.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "routing_keys must name at least one route".to_string(),
            ));
        }

        if self.dequeue_timeout.is_zero() || self.default_job_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "dequeue_timeout and default_job_timeout must be greater than 0".to_string(),
            ));
        }

        if self.success_ttl.is_zero() || self.failure_ttl.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "success_ttl and failure_ttl must be greater than 0".to_string(),
            ));
        }

        if self.tick_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "tick_interval must be greater than 0".to_string(),
            ));
        }

        if self.lock_ttl <= self.tick_interval {
            return Err(ConfigError::ValidationFailed(format!(
                "lock_ttl ({:?}) must exceed tick_interval ({:?})",
                self.lock_ttl, self.tick_interval
            )));
        }

        if self.visibility_timeout <= self.default_job_timeout {
            return Err(ConfigError::ValidationFailed(format!(
                "visibility_timeout ({:?}) must exceed default_job_timeout ({:?})",
                self.visibility_timeout, self.default_job_timeout
            )));
        }

        if matches!(self.max_backoff, Some(d) if d.is_zero()) {
            return Err(ConfigError::ValidationFailed(
                "max_backoff must be greater than 0 when set".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_routing_keys(mut self, keys: Vec<String>) -> Self {
        self.routing_keys = keys;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_result_ttls(mut self, success_ttl: Duration, failure_ttl: Duration) -> Self {
        self.success_ttl = success_ttl;
        self.failure_ttl = failure_ttl;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_schedules_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.schedules_file = Some(path.into());
        self
    }

    pub fn key_space(&self) -> KeySpace {
        KeySpace::new(&self.key_prefix)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let policy = RetryPolicy::default();
        match self.max_backoff {
            Some(max) => policy.with_max_delay(max),
            None => policy,
        }
    }

    /// Builds the queue core over `store` with these settings.
    pub fn job_queue(&self, store: Arc<dyn Store>) -> JobQueue {
        JobQueue::new(store, self.key_space())
            .with_retry_policy(self.retry_policy())
            .with_result_ttls(self.success_ttl, self.failure_ttl)
    }

    /// An empty registry whose handlers default to `default_job_timeout`.
    pub fn handler_registry(&self) -> HandlerRegistry {
        HandlerRegistry::new().with_default_timeout(self.default_job_timeout)
    }

    pub fn pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::new(self.workers)
            .with_routing_keys(self.routing_keys.clone())
            .with_dequeue_timeout(self.dequeue_timeout)
            .with_shutdown_timeout(self.shutdown_timeout)
            .with_visibility_timeout(self.visibility_timeout)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::default()
            .with_tick_interval(self.tick_interval)
            .with_lock_ttl(self.lock_ttl)
            .with_visibility_timeout(self.visibility_timeout)
            .with_reap_interval(self.reap_interval)
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.key_prefix, "bananas");
        assert_eq!(config.workers, 4);
        assert_eq!(config.routing_keys, vec!["default".to_string()]);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.success_ttl, Duration::from_secs(3600));
        assert_eq!(config.failure_ttl, Duration::from_secs(86400));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("BANANAS_REDIS_URL", "redis://cache:6380"),
            ("BANANAS_KEY_PREFIX", "jobs"),
            ("BANANAS_WORKERS", "16"),
            ("BANANAS_ROUTING_KEYS", "gpu, email ,"),
            ("BANANAS_DEQUEUE_TIMEOUT_MS", "250"),
            ("BANANAS_MAX_RETRIES", "5"),
            ("BANANAS_MAX_BACKOFF_SECS", "60"),
            ("BANANAS_SUCCESS_TTL_SECS", "7200"),
            ("BANANAS_FAILURE_TTL_SECS", "60"),
            ("BANANAS_TICK_INTERVAL_MS", "500"),
            ("BANANAS_LOCK_TTL_MS", "2000"),
            ("BANANAS_SCHEDULES_FILE", "/etc/bananas/schedules.yaml"),
        ]))
        .unwrap();

        assert_eq!(config.redis_url, "redis://cache:6380");
        assert_eq!(config.key_space().prefix(), "jobs");
        assert_eq!(config.workers, 16);
        assert_eq!(config.routing_keys, vec!["gpu".to_string(), "email".to_string()]);
        assert_eq!(config.dequeue_timeout, Duration::from_millis(250));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_policy().delay(10), Duration::from_secs(60));
        assert_eq!(config.tick_interval, Duration::from_millis(500));
        assert_eq!(
            config.schedules_file,
            Some(PathBuf::from("/etc/bananas/schedules.yaml"))
        );
        // A failure TTL shorter than the success TTL is allowed
        assert!(config.failure_ttl < config.success_ttl);
    }

    #[test]
    fn test_invalid_number_reports_key() {
        let err = Config::from_lookup(lookup(&[("BANANAS_WORKERS", "lots")])).unwrap_err();
        match err {
            ConfigError::InvalidValue { key, .. } => assert_eq!(key, "BANANAS_WORKERS"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_validation_rules() {
        assert!(Config::default().with_workers(0).validate().is_err());
        assert!(Config::default()
            .with_routing_keys(Vec::new())
            .validate()
            .is_err());
        assert!(Config::default()
            .with_result_ttls(Duration::ZERO, Duration::from_secs(1))
            .validate()
            .is_err());
        assert!(Config::default()
            .with_tick_interval(Duration::from_secs(5))
            .with_lock_ttl(Duration::from_secs(5))
            .validate()
            .is_err());
        assert!(Config::default().with_key_prefix("").validate().is_err());
    }

    #[test]
    fn test_component_configs() {
        let config = Config::default()
            .with_workers(2)
            .with_routing_keys(vec!["email".to_string()]);

        let pool = config.pool_config();
        assert_eq!(pool.num_workers, 2);
        assert_eq!(pool.routing_keys, vec!["email".to_string()]);
        assert_eq!(pool.visibility_timeout, Some(config.visibility_timeout));

        let registry = config.handler_registry();
        assert!(registry.is_empty());

        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.tick_interval, config.tick_interval);
        assert_eq!(scheduler.lock_ttl, config.lock_ttl);
    }
}
