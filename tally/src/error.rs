use chrono::{DateTime, Utc};

use crate::config::ConfigError;
use crate::job::{JobId, JobStatus};

/// Failure reported by a service provider call.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Transient failure; the call may succeed if attempted again.
    #[error("retryable provider error: {0}")]
    Retryable(String),

    /// The provider rejected the request and retrying cannot help.
    #[error("permanent provider error: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(msg) | Self::Permanent(msg) => msg,
        }
    }
}

/// Rejected state machine transition.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("Invalid transition {from} -> {to} for job {id}")]
    Invalid {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {id} has used {attempts} of {max_attempts} attempts")]
    AttemptsExhausted {
        id: JobId,
        attempts: u32,
        max_attempts: u32,
    },
}

/// Failure talking to the persistent store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Failed to (de)serialize record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors surfaced by the pipeline's public operations.
///
/// Job-level failures (provider errors, exhausted attempts) are recorded on
/// the job itself and do not show up here.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),

    #[error(
        "Stale transition for job {id}: expected {expected} at version {version}"
    )]
    StaleTransition {
        id: JobId,
        expected: JobStatus,
        version: u64,
    },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Failed to find job with id {0}")]
    JobNotFound(JobId),

    #[error("Invalid report window: start {start} must be before end {end}")]
    InvalidWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    /// The broker rejected or failed a call the operation depends on.
    #[error("Broker error: {0}")]
    Broker(#[source] anyhow::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_classification() {
        assert!(ProviderError::retryable("503").is_retryable());
        assert!(!ProviderError::permanent("400").is_retryable());
        assert_eq!(ProviderError::permanent("bad sku").message(), "bad sku");
    }

    #[test]
    fn store_error_converts_to_pipeline_error() {
        let err: PipelineError = StoreError::Unavailable("down".into()).into();
        assert!(matches!(err, PipelineError::StoreUnavailable(_)));
        assert_eq!(err.to_string(), "Store unavailable: down");
    }
}
