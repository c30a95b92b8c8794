use thiserror::Error;

use common::CorrelationId;
use store::StoreError;

/// Errors that can occur while processing a saga event.
#[derive(Debug, Error)]
pub enum SagaError {
    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Event payload could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Optimistic-concurrency retries were exhausted; the event goes back to
    /// the relay's retry cycle.
    #[error("concurrency retries exhausted for saga {0}")]
    ConflictRetriesExhausted(CorrelationId),

    /// The engine received an event type outside its workflow's taxonomy.
    #[error("event type not in workflow taxonomy: {0}")]
    UnknownEventType(String),
}

/// Result type for saga operations.
pub type Result<T> = std::result::Result<T, SagaError>;
