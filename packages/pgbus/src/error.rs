use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the message bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// The backing store could not be reached or the statement failed at the
    /// connection level. Safe to retry.
    #[error("message bus unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),

    /// A singleton key conflicted with an in-flight job and the winning row
    /// could not be resolved.
    #[error("queue {queue} rejected singleton key {key}")]
    QueueRejected { queue: String, key: String },

    #[error("job {0} not found")]
    JobNotFound(Uuid),

    #[error("failed to encode job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Whether a handler failure should be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transient failure, retry if attempts remain.
    Retryable,
    /// Permanent failure, move straight to `failed`.
    NonRetryable,
}

impl FailureKind {
    pub fn should_retry(&self) -> bool {
        matches!(self, FailureKind::Retryable)
    }
}
