use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use common::{CorrelationId, OutboxId};

use crate::{
    OutboxRow, Record, Result, SagaInstance, StoreError, Version,
    store::{SagaStore, StoreTransaction},
};

#[derive(Default)]
struct InMemoryState {
    records: HashMap<CorrelationId, Record>,
    outbox: Vec<OutboxRow>,
    sagas: HashMap<CorrelationId, SagaInstance>,
    /// Rows handed out by `claim_due_outbox` and not yet released.
    claimed: HashSet<OutboxId>,
    next_seq: i64,
}

/// In-memory store implementation for testing.
///
/// Provides the same interface and semantics as the PostgreSQL
/// implementation, including transactional atomicity: a transaction holds the
/// state lock for its lifetime and stages writes that apply on commit.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of outbox rows, processed or not.
    pub async fn outbox_len(&self) -> usize {
        self.state.lock().await.outbox.len()
    }

    /// Returns a snapshot of an outbox row by ID.
    pub async fn outbox_row(&self, id: OutboxId) -> Option<OutboxRow> {
        self.state
            .lock()
            .await
            .outbox
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    /// Clears all state.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        *state = InMemoryState::default();
    }
}

/// A transaction over the in-memory store.
///
/// Holds the state lock exclusively, so validation done at operation time
/// (duplicate keys, version checks) stays valid through commit.
pub struct InMemoryTx {
    guard: OwnedMutexGuard<InMemoryState>,
    staged_records: Vec<Record>,
    staged_outbox: Vec<OutboxRow>,
    staged_sagas: Vec<SagaInstance>,
}

#[async_trait]
impl SagaStore for InMemoryStore {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<InMemoryTx> {
        let guard = self.state.clone().lock_owned().await;
        Ok(InMemoryTx {
            guard,
            staged_records: Vec::new(),
            staged_outbox: Vec::new(),
            staged_sagas: Vec::new(),
        })
    }

    async fn claim_due_outbox(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<Vec<OutboxRow>> {
        let mut state = self.state.lock().await;

        let mut due: Vec<OutboxRow> = state
            .outbox
            .iter()
            .filter(|r| !r.processed && r.scheduled_for <= now && !state.claimed.contains(&r.id))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.scheduled_for
                .cmp(&b.scheduled_for)
                .then(a.seq.cmp(&b.seq))
        });
        due.truncate(batch_size);

        for row in &due {
            state.claimed.insert(row.id);
        }
        Ok(due)
    }

    async fn mark_processed(&self, id: OutboxId) -> Result<()> {
        let mut state = self.state.lock().await;
        state.claimed.remove(&id);
        let row = state
            .outbox
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::OutboxRowNotFound(id))?;
        row.processed = true;
        row.processed_at = Some(Utc::now());
        row.last_error = None;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: OutboxId,
        error: &str,
        next_scheduled_for: DateTime<Utc>,
        retry_count: u32,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.claimed.remove(&id);
        let row = state
            .outbox
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::OutboxRowNotFound(id))?;
        row.retry_count = retry_count;
        row.last_error = Some(error.to_string());
        row.scheduled_for = next_scheduled_for;
        Ok(())
    }

    async fn mark_dead_lettered(&self, id: OutboxId, error: &str, retry_count: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        state.claimed.remove(&id);
        let row = state
            .outbox
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::OutboxRowNotFound(id))?;
        row.processed = true;
        row.processed_at = Some(Utc::now());
        row.retry_count = retry_count;
        row.last_error = Some(error.to_string());
        Ok(())
    }

    async fn load_saga(&self, correlation_id: CorrelationId) -> Result<Option<SagaInstance>> {
        let state = self.state.lock().await;
        Ok(state.sagas.get(&correlation_id).cloned())
    }

    async fn record_count(&self) -> Result<u64> {
        Ok(self.state.lock().await.records.len() as u64)
    }

    async fn unprocessed_outbox_count(&self) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state.outbox.iter().filter(|r| !r.processed).count() as u64)
    }

    async fn saga_counts_by_state(&self) -> Result<HashMap<String, u64>> {
        let state = self.state.lock().await;
        let mut counts: HashMap<String, u64> = HashMap::new();
        for saga in state.sagas.values() {
            *counts.entry(saga.current_state.clone()).or_default() += 1;
        }
        Ok(counts)
    }

    async fn recent_outbox(&self, limit: usize) -> Result<Vec<OutboxRow>> {
        let state = self.state.lock().await;
        let mut rows = state.outbox.clone();
        rows.sort_by(|a, b| b.seq.cmp(&a.seq));
        rows.truncate(limit);
        Ok(rows)
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTx {
    async fn insert_record(&mut self, record: &Record) -> Result<()> {
        if self.guard.records.contains_key(&record.id)
            || self.staged_records.iter().any(|r| r.id == record.id)
        {
            return Err(StoreError::DuplicateKey(record.id));
        }
        self.staged_records.push(record.clone());
        Ok(())
    }

    async fn enqueue_outbox(
        &mut self,
        event_type: &str,
        payload: &[u8],
        scheduled_for: DateTime<Utc>,
    ) -> Result<OutboxId> {
        let row = OutboxRow::new(event_type, payload.to_vec(), scheduled_for);
        let id = row.id;
        self.staged_outbox.push(row);
        Ok(id)
    }

    async fn save_saga(
        &mut self,
        instance: &SagaInstance,
        expected_version: Version,
    ) -> Result<()> {
        let stored = self
            .staged_sagas
            .iter()
            .rev()
            .find(|s| s.correlation_id == instance.correlation_id)
            .map(|s| s.version)
            .or_else(|| {
                self.guard
                    .sagas
                    .get(&instance.correlation_id)
                    .map(|s| s.version)
            })
            .unwrap_or_else(Version::initial);

        if stored != expected_version {
            return Err(StoreError::ConcurrencyConflict {
                correlation_id: instance.correlation_id,
                expected: expected_version,
                actual: stored,
            });
        }

        let mut saved = instance.clone();
        saved.version = expected_version.next();
        self.staged_sagas.push(saved);
        Ok(())
    }

    async fn commit(mut self) -> Result<()> {
        for record in self.staged_records.drain(..) {
            self.guard.records.insert(record.id, record);
        }
        for mut row in self.staged_outbox.drain(..) {
            self.guard.next_seq += 1;
            row.seq = self.guard.next_seq;
            self.guard.outbox.push(row);
        }
        for saga in self.staged_sagas.drain(..) {
            self.guard.sagas.insert(saga.correlation_id, saga);
        }
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: CorrelationId) -> Record {
        Record::new(id, HashMap::new())
    }

    fn instance(id: CorrelationId) -> SagaInstance {
        SagaInstance {
            correlation_id: id,
            workflow: "OrderProcessing".to_string(),
            current_state: "AwaitingCreateOrder".to_string(),
            original_record: record(id),
            started_at: Utc::now(),
            last_updated: Utc::now(),
            completed_at: None,
            last_error: None,
            steps: Vec::new(),
            version: Version::initial(),
        }
    }

    #[tokio::test]
    async fn insert_record_then_duplicate() {
        let store = InMemoryStore::new();
        let id = CorrelationId::new();

        let mut tx = store.begin().await.unwrap();
        tx.insert_record(&record(id)).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let err = tx.insert_record(&record(id)).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey(dup) if dup == id));
        tx.commit().await.unwrap();

        assert_eq!(store.record_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rollback_discards_staged_writes() {
        let store = InMemoryStore::new();
        let id = CorrelationId::new();

        let mut tx = store.begin().await.unwrap();
        tx.insert_record(&record(id)).await.unwrap();
        tx.enqueue_outbox("SagaStarted", b"{}", Utc::now())
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(store.record_count().await.unwrap(), 0);
        assert_eq!(store.outbox_len().await, 0);
    }

    #[tokio::test]
    async fn record_and_outbox_commit_atomically() {
        let store = InMemoryStore::new();
        let id = CorrelationId::new();

        let mut tx = store.begin().await.unwrap();
        tx.insert_record(&record(id)).await.unwrap();
        tx.enqueue_outbox("SagaStarted", b"{}", Utc::now())
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.record_count().await.unwrap(), 1);
        assert_eq!(store.unprocessed_outbox_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn claim_respects_scheduled_for_and_order() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(60);

        let mut tx = store.begin().await.unwrap();
        tx.enqueue_outbox("A", b"a", now).await.unwrap();
        tx.enqueue_outbox("B", b"b", now).await.unwrap();
        tx.enqueue_outbox("C", b"c", later).await.unwrap();
        tx.commit().await.unwrap();

        let claimed = store.claim_due_outbox(now, 10).await.unwrap();
        assert_eq!(claimed.len(), 2);
        // Equal scheduled_for: insertion order wins.
        assert_eq!(claimed[0].event_type, "A");
        assert_eq!(claimed[1].event_type, "B");

        let claimed = store.claim_due_outbox(later, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].event_type, "C");
    }

    #[tokio::test]
    async fn claimed_rows_are_not_handed_out_twice() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        let mut tx = store.begin().await.unwrap();
        let id = tx.enqueue_outbox("A", b"a", now).await.unwrap();
        tx.commit().await.unwrap();

        let first = store.claim_due_outbox(now, 10).await.unwrap();
        assert_eq!(first.len(), 1);

        let second = store.claim_due_outbox(now, 10).await.unwrap();
        assert!(second.is_empty());

        // Releasing via mark_failed makes the row claimable again.
        store
            .mark_failed(id, "publish failed", now, 1)
            .await
            .unwrap();
        let third = store.claim_due_outbox(now, 10).await.unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].retry_count, 1);
        assert_eq!(third[0].last_error.as_deref(), Some("publish failed"));
    }

    #[tokio::test]
    async fn mark_processed_clears_error_and_retires_row() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        let mut tx = store.begin().await.unwrap();
        let id = tx.enqueue_outbox("A", b"a", now).await.unwrap();
        tx.commit().await.unwrap();

        store.mark_failed(id, "transient", now, 1).await.unwrap();
        store.mark_processed(id).await.unwrap();

        let row = store.outbox_row(id).await.unwrap();
        assert!(row.processed);
        assert!(row.processed_at.is_some());
        assert!(row.last_error.is_none());
        assert!(!row.is_dead_lettered());
        assert_eq!(store.unprocessed_outbox_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn dead_lettered_row_is_distinguishable() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        let mut tx = store.begin().await.unwrap();
        let id = tx.enqueue_outbox("A", b"a", now).await.unwrap();
        tx.commit().await.unwrap();

        store.claim_due_outbox(now, 10).await.unwrap();
        store.mark_dead_lettered(id, "gave up", 5).await.unwrap();

        let row = store.outbox_row(id).await.unwrap();
        assert!(row.is_dead_lettered());
        assert_eq!(row.retry_count, 5);
        assert_eq!(row.last_error.as_deref(), Some("gave up"));

        // Dead-lettered rows are never claimed again.
        assert!(store.claim_due_outbox(now, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_saga_new_instance() {
        let store = InMemoryStore::new();
        let id = CorrelationId::new();

        let mut tx = store.begin().await.unwrap();
        tx.save_saga(&instance(id), Version::initial()).await.unwrap();
        tx.commit().await.unwrap();

        let loaded = store.load_saga(id).await.unwrap().unwrap();
        assert_eq!(loaded.version, Version::new(1));
    }

    #[tokio::test]
    async fn save_saga_conflict_on_stale_version() {
        let store = InMemoryStore::new();
        let id = CorrelationId::new();

        let mut tx = store.begin().await.unwrap();
        tx.save_saga(&instance(id), Version::initial()).await.unwrap();
        tx.commit().await.unwrap();

        // Stale writer still believes the saga is unsaved.
        let mut tx = store.begin().await.unwrap();
        let err = tx
            .save_saga(&instance(id), Version::initial())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConcurrencyConflict { .. }));
        tx.rollback().await.unwrap();

        // The correct expected version succeeds.
        let mut updated = store.load_saga(id).await.unwrap().unwrap();
        updated.current_state = "AwaitingProcessOrder".to_string();
        let mut tx = store.begin().await.unwrap();
        tx.save_saga(&updated, updated.version).await.unwrap();
        tx.commit().await.unwrap();

        let loaded = store.load_saga(id).await.unwrap().unwrap();
        assert_eq!(loaded.version, Version::new(2));
        assert_eq!(loaded.current_state, "AwaitingProcessOrder");
    }

    #[tokio::test]
    async fn saga_counts_group_by_state() {
        let store = InMemoryStore::new();

        for state in ["AwaitingCreateOrder", "AwaitingCreateOrder", "Final"] {
            let id = CorrelationId::new();
            let mut saga = instance(id);
            saga.current_state = state.to_string();
            let mut tx = store.begin().await.unwrap();
            tx.save_saga(&saga, Version::initial()).await.unwrap();
            tx.commit().await.unwrap();
        }

        let counts = store.saga_counts_by_state().await.unwrap();
        assert_eq!(counts.get("AwaitingCreateOrder"), Some(&2));
        assert_eq!(counts.get("Final"), Some(&1));
    }

    #[tokio::test]
    async fn recent_outbox_returns_newest_first() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        let mut tx = store.begin().await.unwrap();
        tx.enqueue_outbox("A", b"a", now).await.unwrap();
        tx.enqueue_outbox("B", b"b", now).await.unwrap();
        tx.enqueue_outbox("C", b"c", now).await.unwrap();
        tx.commit().await.unwrap();

        let rows = store.recent_outbox(2).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].event_type, "C");
        assert_eq!(rows[1].event_type, "B");
    }
}
