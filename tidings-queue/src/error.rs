//! Error types for queue, store, delivery and configuration operations.

use crate::job::{JobId, JobStatus};
use std::time::Duration;
use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Result type for job log store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Queue-specific errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Caller input is malformed or missing.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The job was already delivered; callers should treat this as success.
    #[error("Job already processed: {0}")]
    AlreadyProcessed(JobId),

    /// Too many jobs for this subject in the trailing window.
    #[error("Rate limit exceeded for subject {subject_id}: {limit} jobs per {}s", .window.as_secs())]
    RateLimitExceeded {
        subject_id: String,
        limit: u64,
        window: Duration,
    },

    /// No job log record exists for this id.
    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// Delivery failed but attempts remain; the queue schedules a redelivery.
    #[error("Delivery attempt {attempt} failed: {message}")]
    TransientDelivery { attempt: u32, message: String },

    /// Delivery failed on the final attempt; the job is dead-lettered.
    #[error("Delivery failed after {attempts} attempts: {message}")]
    ExhaustedRetries { attempts: u32, message: String },

    /// The audit store failed.
    #[error("Job log error: {0}")]
    LogWrite(#[from] StoreError),

    /// The delivery lease is no longer held by this consumer.
    #[error("Stale delivery for job {0}")]
    StaleDelivery(JobId),

    /// Message queue failure.
    #[error("Broker error: {0}")]
    Broker(String),

    /// Notification content could not be rendered.
    #[error("Content error: {0}")]
    Content(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Redis error
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Worker already running
    #[error("Worker already running")]
    WorkerAlreadyRunning,
}

impl QueueError {
    /// HTTP status code the API layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound(_) => 404,
            Self::AlreadyProcessed(_) => 409,
            Self::RateLimitExceeded { .. } => 429,
            _ => 500,
        }
    }

    /// Whether the error is meant to be reported back to the enqueueing caller.
    pub fn is_caller_reportable(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::AlreadyProcessed(_)
                | Self::RateLimitExceeded { .. }
                | Self::NotFound(_)
        )
    }

    /// Short machine-readable code for error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::AlreadyProcessed(_) => "already_processed",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::NotFound(_) => "not_found",
            Self::TransientDelivery { .. } => "transient_delivery",
            Self::ExhaustedRetries { .. } => "exhausted_retries",
            Self::LogWrite(_) => "log_write",
            _ => "internal_error",
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Job log store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Record missing.
    #[error("Job log record not found: {0}")]
    NotFound(JobId),

    /// Status change not allowed by the job state machine.
    #[error("Invalid status transition for {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    /// Backend unavailable or failed.
    #[error("Store backend error: {0}")]
    Backend(String),

    /// Record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

/// Delivery channel errors.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Transport-level failure (connection refused, reset, 4xx/5xx relay reply).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The message was refused and resending will not help.
    #[error("Message rejected: {0}")]
    Rejected(String),

    /// The channel did not answer in time.
    #[error("Delivery timed out")]
    Timeout,
}

impl DeliveryError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout)
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(QueueError::Validation("x".into()).status_code(), 400);
        assert_eq!(QueueError::NotFound(JobId::from("a")).status_code(), 404);
        assert_eq!(
            QueueError::AlreadyProcessed(JobId::from("a")).status_code(),
            409
        );
        let limited = QueueError::RateLimitExceeded {
            subject_id: "u1".into(),
            limit: 10,
            window: Duration::from_secs(3600),
        };
        assert_eq!(limited.status_code(), 429);
        assert_eq!(QueueError::Broker("down".into()).status_code(), 500);
    }

    #[test]
    fn test_caller_reportable() {
        assert!(QueueError::Validation("x".into()).is_caller_reportable());
        assert!(!QueueError::Broker("down".into()).is_caller_reportable());
        assert!(
            !QueueError::TransientDelivery {
                attempt: 1,
                message: "boom".into()
            }
            .is_caller_reportable()
        );
    }

    #[test]
    fn test_rate_limit_display() {
        let err = QueueError::RateLimitExceeded {
            subject_id: "u1".into(),
            limit: 10,
            window: Duration::from_secs(3600),
        };
        let display = err.to_string();
        assert!(display.contains("u1"));
        assert!(display.contains("3600s"));
    }

    #[test]
    fn test_delivery_error_retryable() {
        assert!(DeliveryError::Timeout.is_retryable());
        assert!(DeliveryError::Transport("reset".into()).is_retryable());
        assert!(!DeliveryError::Rejected("bad address".into()).is_retryable());
    }
}
