//! Configuration for the queue service, retry policy, rate limit and worker.
//!
//! Configuration can be loaded from a TOML or JSON file, from environment
//! variables prefixed with `TIDINGS_`, or both (environment wins).
//!
//! ```
//! use tidings_queue::TidingsConfig;
//!
//! let config = TidingsConfig::from_toml_str(r#"
//!     queue_name = "user.signin.notification"
//!
//!     [retry]
//!     max_attempts = 3
//!
//!     [rate_limit]
//!     max_jobs = 20
//! "#).unwrap();
//!
//! assert_eq!(config.retry.max_attempts, 3);
//! assert_eq!(config.rate_limit.max_jobs, 20);
//! assert_eq!(config.worker.concurrency, 4);
//! ```

use crate::broker::{Backoff, SubmitOptions};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "TIDINGS";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TidingsConfig {
    /// Redis connection URL
    pub redis_url: String,

    /// Queue name
    pub queue_name: String,

    /// Key prefix for Redis keys
    pub key_prefix: String,

    pub retry: RetryPolicy,
    pub rate_limit: RateLimitConfig,
    pub worker: WorkerConfig,
}

impl Default for TidingsConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            queue_name: "user.signin.notification".to_string(),
            key_prefix: "tidings".to_string(),
            retry: RetryPolicy::default(),
            rate_limit: RateLimitConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

/// Retry policy applied to every submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delivery attempts before a job is dead-lettered
    pub max_attempts: u32,
    /// Delay before the first redelivery; doubles each attempt
    pub backoff_base_ms: u64,
    /// Upper bound on a single backoff delay
    pub backoff_max_secs: u64,
    /// Completed jobs retained by the queue
    pub keep_completed: usize,
    /// Failed jobs retained by the queue (unlimited when unset)
    pub keep_failed: Option<usize>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 2000,
            backoff_max_secs: 3600,
            keep_completed: 100,
            keep_failed: None,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Backoff {
        Backoff::exponential(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_secs(self.backoff_max_secs),
        )
    }

    /// Per-submission options handed to the message queue.
    pub fn submit_options(&self) -> SubmitOptions {
        SubmitOptions {
            max_attempts: self.max_attempts,
            backoff: self.backoff(),
            keep_completed: self.keep_completed,
            keep_failed: self.keep_failed,
        }
    }
}

/// Per-subject enqueue throttle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Jobs allowed per subject within the window
    pub max_jobs: u64,
    /// Trailing window length
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_jobs: 10,
            window_secs: 3600,
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Worker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of concurrent consumers
    pub concurrency: usize,
    /// Poll interval when the queue is empty
    pub poll_interval_ms: u64,
    /// How often expired leases are swept back into the queue
    pub stall_check_secs: u64,
    /// Lease length before an unacknowledged delivery counts as stalled
    pub visibility_timeout_secs: u64,
    /// How long shutdown waits for in-flight attempts
    pub shutdown_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval_ms: 1000,
            stall_check_secs: 30,
            visibility_timeout_secs: 30,
            shutdown_timeout_secs: 30,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stall_check_interval(&self) -> Duration {
        Duration::from_secs(self.stall_check_secs)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl TidingsConfig {
    /// Defaults overlaid with `TIDINGS_*` environment variables.
    ///
    /// A `.env` file in the working directory is loaded first if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.toml` or `.json` file, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let mut config = Self::from_file(path)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file; the format is picked by extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            Some("json") => Self::from_json_str(&content),
            Some(other) => Err(ConfigError::Load(format!("Unsupported format: {}", other))),
            None => Err(ConfigError::Load("No file extension found".to_string())),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(format!("TOML: {}", e)))
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse(format!("JSON: {}", e)))
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|key| env::var(key).ok())
    }

    /// Apply overrides from any key lookup. Split out so tests never touch the
    /// process environment.
    pub fn apply_vars<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}_{}", ENV_PREFIX, name));

        if let Some(url) = var("REDIS_URL").or_else(|| lookup("REDIS_URL")) {
            self.redis_url = url;
        } else if let Some(host) = lookup("REDIS_HOST") {
            let port = lookup("REDIS_PORT").unwrap_or_else(|| "6379".to_string());
            self.redis_url = match lookup("REDIS_PASSWORD") {
                Some(password) => format!("redis://:{}@{}:{}", password, host, port),
                None => format!("redis://{}:{}", host, port),
            };
        }

        if let Some(name) = var("QUEUE_NAME") {
            self.queue_name = name;
        }
        if let Some(prefix) = var("KEY_PREFIX") {
            self.key_prefix = prefix;
        }

        parse_into(&var, "MAX_ATTEMPTS", &mut self.retry.max_attempts)?;
        parse_into(&var, "BACKOFF_BASE_MS", &mut self.retry.backoff_base_ms)?;
        parse_into(&var, "BACKOFF_MAX_SECS", &mut self.retry.backoff_max_secs)?;
        parse_into(&var, "KEEP_COMPLETED", &mut self.retry.keep_completed)?;
        if let Some(raw) = var("KEEP_FAILED") {
            self.retry.keep_failed = Some(parse_value("KEEP_FAILED", &raw)?);
        }

        parse_into(&var, "RATE_LIMIT_MAX", &mut self.rate_limit.max_jobs)?;
        parse_into(&var, "RATE_LIMIT_WINDOW_SECS", &mut self.rate_limit.window_secs)?;

        parse_into(&var, "WORKER_CONCURRENCY", &mut self.worker.concurrency)?;
        parse_into(&var, "POLL_INTERVAL_MS", &mut self.worker.poll_interval_ms)?;
        parse_into(&var, "STALL_CHECK_SECS", &mut self.worker.stall_check_secs)?;
        parse_into(
            &var,
            "VISIBILITY_TIMEOUT_SECS",
            &mut self.worker.visibility_timeout_secs,
        )?;
        parse_into(
            &var,
            "SHUTDOWN_TIMEOUT_SECS",
            &mut self.worker.shutdown_timeout_secs,
        )?;

        Ok(())
    }

    /// Reject settings the queue cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_name.trim().is_empty() {
            return Err(ConfigError::Invalid("queue_name must not be empty".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.rate_limit.max_jobs == 0 {
            return Err(ConfigError::Invalid("rate_limit.max_jobs must be at least 1".into()));
        }
        if self.rate_limit.window_secs == 0 {
            return Err(ConfigError::Invalid("rate_limit.window_secs must be non-zero".into()));
        }
        if self.worker.concurrency == 0 {
            return Err(ConfigError::Invalid("worker.concurrency must be at least 1".into()));
        }
        if self.worker.visibility_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "worker.visibility_timeout_secs must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

fn parse_value<T: FromStr>(name: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::Parse(format!("{}_{}: invalid value '{}'", ENV_PREFIX, name, raw)))
}

fn parse_into<T, F>(var: &F, name: &str, slot: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = var(name) {
        *slot = parse_value(name, &raw)?;
    }
    Ok(())
}
