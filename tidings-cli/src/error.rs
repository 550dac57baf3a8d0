//! Error types for the tidings CLI.

use thiserror::Error;
use tidings_queue::{ConfigError, QueueError, StoreError};

/// Result type for CLI operations.
pub type CliResult<T> = Result<T, CliError>;

/// CLI error types.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Output could not be encoded
    #[error("Output error: {0}")]
    Output(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for CliError {
    fn from(err: StoreError) -> Self {
        CliError::Queue(QueueError::LogWrite(err))
    }
}

impl CliError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_) | CliError::InvalidArgument(_) => 2,
            CliError::Queue(QueueError::NotFound(_)) => 3,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidings_queue::JobId;

    #[test]
    fn test_exit_codes() {
        let config = CliError::from(ConfigError::Invalid("x".into()));
        assert_eq!(config.exit_code(), 2);

        let missing = CliError::from(QueueError::NotFound(JobId::from("j1")));
        assert_eq!(missing.exit_code(), 3);

        let broker = CliError::from(QueueError::Broker("down".into()));
        assert_eq!(broker.exit_code(), 1);
    }

    #[test]
    fn test_store_error_wraps_as_log_write() {
        let err = CliError::from(StoreError::Backend("gone".into()));
        assert!(matches!(err, CliError::Queue(QueueError::LogWrite(_))));
    }
}
