use thiserror::Error;

use common::CorrelationId;

use crate::Version;

/// Errors that can occur when interacting with the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A record with this ID is already persisted.
    ///
    /// This is a normal, recoverable condition under source redelivery;
    /// ingress treats it as "already handled, skip".
    #[error("duplicate record: {0}")]
    DuplicateKey(CorrelationId),

    /// The saga was modified concurrently.
    /// The expected version did not match the stored version.
    #[error(
        "concurrency conflict for saga {correlation_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        correlation_id: CorrelationId,
        expected: Version,
        actual: Version,
    },

    /// The referenced outbox row does not exist.
    #[error("outbox row not found: {0}")]
    OutboxRowNotFound(common::OutboxId),

    /// A database error occurred.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
