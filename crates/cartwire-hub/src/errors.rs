//! Hub error types.

use thiserror::Error;

/// Errors from the queue's persistence adapter.
///
/// Fan-out itself never fails; delivery problems surface as
/// [`DeliveryReport`](crate::DeliveryReport) counts and dropped connections.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The store rejected an operation.
    #[error("queue store error: {0}")]
    Store(String),

    /// An entry could not be encoded or decoded.
    #[error("queue entry serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for queue persistence.
pub type Result<T> = std::result::Result<T, QueueError>;
