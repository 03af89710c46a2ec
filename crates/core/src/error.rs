//! Error types for the drudge job queue library.

use std::time::Duration;
use thiserror::Error;

/// The main error type for queue operations.
#[derive(Error, Debug)]
pub enum QueueError {
    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backing store is unreachable.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Driver-specific storage error.
    #[error("Driver error: {0}")]
    Driver(String),

    /// Job not found.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid cron expression for a recurring schedule.
    #[error("Invalid cron expression '{0}': {1}")]
    InvalidCron(String, String),

    /// The driver does not support the requested operation.
    #[error("Operation not supported by this driver: {0}")]
    Unsupported(&'static str),
}

/// Result type alias using QueueError.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Classified failure returned from job handlers.
///
/// The worker commits a different terminal state for each variant:
/// retryable failures consume an attempt and move the job to `retry_pending`
/// with backoff, permanent failures go straight to `failed`, and rate-limited
/// failures re-queue the job after the given delay without consuming an
/// attempt.
#[derive(Debug)]
pub enum JobError {
    /// Transient failure; retry with backoff if attempts remain.
    Retryable { message: String },
    /// Unrecoverable failure; skip retries and fail the job.
    Permanent { message: String },
    /// Upstream rate limit; re-queue after `retry_after` without
    /// consuming an attempt.
    RateLimited {
        message: String,
        retry_after: Duration,
    },
}

impl JobError {
    /// Create a retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
        }
    }

    /// Create a permanent (non-retryable) error.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    /// Create a rate-limited error with an explicit delay hint.
    pub fn rate_limited(message: impl Into<String>, retry_after: Duration) -> Self {
        Self::RateLimited {
            message: message.into(),
            retry_after,
        }
    }

    /// The failure message, regardless of classification.
    pub fn message(&self) -> &str {
        match self {
            Self::Retryable { message }
            | Self::Permanent { message }
            | Self::RateLimited { message, .. } => message,
        }
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retryable { message } => write!(f, "retryable: {}", message),
            Self::Permanent { message } => write!(f, "permanent: {}", message),
            Self::RateLimited {
                message,
                retry_after,
            } => write!(f, "rate limited ({}ms): {}", retry_after.as_millis(), message),
        }
    }
}

/// Unclassified handler errors default to retryable.
impl<E: std::error::Error> From<E> for JobError {
    fn from(err: E) -> Self {
        Self::retryable(err.to_string())
    }
}
