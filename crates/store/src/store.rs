use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use common::{CorrelationId, OutboxId};

use crate::{OutboxRow, Record, Result, SagaInstance, Version};

/// Core trait for saga store implementations.
///
/// All implementations must be thread-safe (`Send + Sync`). Mutations of
/// records, outbox rows, and saga instances that must be atomic go through
/// [`SagaStore::begin`]; everything else operates directly on the store.
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// The transaction type produced by [`SagaStore::begin`].
    type Tx: StoreTransaction;

    /// Opens a transaction. All writes staged on the returned value either
    /// commit atomically or roll back together.
    async fn begin(&self) -> Result<Self::Tx>;

    /// Returns up to `batch_size` unprocessed rows with
    /// `scheduled_for <= now`, ordered by `scheduled_for` ascending with the
    /// insertion sequence as tie-break.
    ///
    /// A claimed row is not handed to any other caller until released by
    /// [`mark_processed`](SagaStore::mark_processed),
    /// [`mark_failed`](SagaStore::mark_failed), or
    /// [`mark_dead_lettered`](SagaStore::mark_dead_lettered).
    async fn claim_due_outbox(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<Vec<OutboxRow>>;

    /// Marks a row successfully published. The row is immutable afterwards.
    async fn mark_processed(&self, id: OutboxId) -> Result<()>;

    /// Records a failed publish attempt and reschedules the row.
    async fn mark_failed(
        &self,
        id: OutboxId,
        error: &str,
        next_scheduled_for: DateTime<Utc>,
        retry_count: u32,
    ) -> Result<()>;

    /// Retires a row whose retry budget is exhausted: `processed = true` with
    /// `last_error` and the final `retry_count` retained for inspection.
    async fn mark_dead_lettered(&self, id: OutboxId, error: &str, retry_count: u32) -> Result<()>;

    /// Loads a saga instance by correlation ID.
    ///
    /// Returns `None` if no saga exists for this correlation ID. The returned
    /// instance carries its stored version for use as `expected_version` on
    /// the next save.
    async fn load_saga(&self, correlation_id: CorrelationId) -> Result<Option<SagaInstance>>;

    // -- Read-only accessors for the monitoring surface --

    /// Total number of persisted records.
    async fn record_count(&self) -> Result<u64>;

    /// Number of outbox rows not yet processed.
    async fn unprocessed_outbox_count(&self) -> Result<u64>;

    /// Saga counts grouped by `current_state`.
    async fn saga_counts_by_state(&self) -> Result<HashMap<String, u64>>;

    /// The most recently enqueued outbox rows, newest first.
    async fn recent_outbox(&self, limit: usize) -> Result<Vec<OutboxRow>>;
}

/// A single ACID transaction against the store.
///
/// Dropped without [`commit`](StoreTransaction::commit), a transaction rolls
/// back; [`rollback`](StoreTransaction::rollback) makes that explicit.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Inserts an inbound record.
    ///
    /// Fails with [`StoreError::DuplicateKey`](crate::StoreError::DuplicateKey)
    /// if a record with this ID is already present, a normal condition under
    /// transport redelivery rather than an exceptional one.
    async fn insert_record(&mut self, record: &Record) -> Result<()>;

    /// Stages an outbox row for the given event type and payload, due at
    /// `scheduled_for`. Returns the new row's ID.
    async fn enqueue_outbox(
        &mut self,
        event_type: &str,
        payload: &[u8],
        scheduled_for: DateTime<Utc>,
    ) -> Result<OutboxId>;

    /// Saves a saga instance, creating it if `expected_version` is
    /// [`Version::initial`].
    ///
    /// Fails with
    /// [`StoreError::ConcurrencyConflict`](crate::StoreError::ConcurrencyConflict)
    /// if the stored version does not match `expected_version`. On success
    /// the stored version advances to `expected_version.next()`.
    async fn save_saga(&mut self, instance: &SagaInstance, expected_version: Version)
    -> Result<()>;

    /// Commits all staged writes atomically.
    async fn commit(self) -> Result<()>;

    /// Discards all staged writes.
    async fn rollback(self) -> Result<()>;
}
