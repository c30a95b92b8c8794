use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, postgres::PgRow};
use uuid::Uuid;

use common::{CorrelationId, OutboxId};

use crate::{
    OutboxRow, Record, Result, SagaInstance, StepProgress, StoreError, Version,
    store::{SagaStore, StoreTransaction},
};

/// How long a claim stays exclusive before a row is considered abandoned by
/// a dead relay and becomes claimable again.
const CLAIM_LEASE_SECS: i64 = 300;

/// PostgreSQL-backed saga store.
///
/// A claim is one atomic statement: rows are selected with
/// `FOR UPDATE SKIP LOCKED` and stamped with `claimed_at` before the
/// statement commits, so the claim outlives the row locks. A claimed row is
/// not handed to any other caller until `mark_processed`, `mark_failed`, or
/// `mark_dead_lettered` releases it, or its lease expires.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_outbox(row: PgRow) -> Result<OutboxRow> {
        Ok(OutboxRow {
            id: OutboxId::from_uuid(row.try_get::<Uuid, _>("id")?),
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            scheduled_for: row.try_get("scheduled_for")?,
            processed: row.try_get("processed")?,
            processed_at: row.try_get("processed_at")?,
            retry_count: row.try_get::<i32, _>("retry_count")? as u32,
            last_error: row.try_get("last_error")?,
            seq: row.try_get("seq")?,
            enqueued_at: row.try_get("enqueued_at")?,
        })
    }

    fn row_to_saga(row: PgRow) -> Result<SagaInstance> {
        let record_json: serde_json::Value = row.try_get("original_record")?;
        let steps_json: serde_json::Value = row.try_get("steps")?;
        let original_record: Record = serde_json::from_value(record_json)?;
        let steps: Vec<StepProgress> = serde_json::from_value(steps_json)?;

        Ok(SagaInstance {
            correlation_id: CorrelationId::from_uuid(row.try_get::<Uuid, _>("correlation_id")?),
            workflow: row.try_get("workflow")?,
            current_state: row.try_get("current_state")?,
            original_record,
            started_at: row.try_get("started_at")?,
            last_updated: row.try_get("last_updated")?,
            completed_at: row.try_get("completed_at")?,
            last_error: row.try_get("last_error")?,
            steps,
            version: Version::new(row.try_get("version")?),
        })
    }
}

/// A PostgreSQL transaction staging record, outbox, and saga writes.
pub struct PostgresTx {
    tx: sqlx::Transaction<'static, Postgres>,
}

#[async_trait]
impl SagaStore for PostgresStore {
    type Tx = PostgresTx;

    async fn begin(&self) -> Result<PostgresTx> {
        let tx = self.pool.begin().await?;
        Ok(PostgresTx { tx })
    }

    async fn claim_due_outbox(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<Vec<OutboxRow>> {
        let stale_before = now - chrono::Duration::seconds(CLAIM_LEASE_SECS);

        let rows = sqlx::query(
            r#"
            UPDATE outbox_events
            SET claimed_at = $1
            WHERE id IN (
                SELECT id
                FROM outbox_events
                WHERE processed = FALSE
                  AND scheduled_for <= $1
                  AND (claimed_at IS NULL OR claimed_at <= $2)
                ORDER BY scheduled_for ASC, seq ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, event_type, payload, scheduled_for, processed, processed_at,
                      retry_count, last_error, seq, enqueued_at
            "#,
        )
        .bind(now)
        .bind(stale_before)
        .bind(batch_size as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = rows
            .into_iter()
            .map(Self::row_to_outbox)
            .collect::<Result<Vec<_>>>()?;
        // RETURNING does not preserve the subquery's ordering.
        claimed.sort_by(|a, b| {
            a.scheduled_for
                .cmp(&b.scheduled_for)
                .then(a.seq.cmp(&b.seq))
        });
        Ok(claimed)
    }

    async fn mark_processed(&self, id: OutboxId) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET processed = TRUE, processed_at = $2, last_error = NULL, claimed_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::OutboxRowNotFound(id));
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: OutboxId,
        error: &str,
        next_scheduled_for: DateTime<Utc>,
        retry_count: u32,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET retry_count = $2, last_error = $3, scheduled_for = $4, claimed_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(retry_count as i32)
        .bind(error)
        .bind(next_scheduled_for)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::OutboxRowNotFound(id));
        }
        Ok(())
    }

    async fn mark_dead_lettered(&self, id: OutboxId, error: &str, retry_count: u32) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET processed = TRUE, processed_at = $2, retry_count = $3, last_error = $4,
                claimed_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(Utc::now())
        .bind(retry_count as i32)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::OutboxRowNotFound(id));
        }
        Ok(())
    }

    async fn load_saga(&self, correlation_id: CorrelationId) -> Result<Option<SagaInstance>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT correlation_id, workflow, current_state, original_record, steps,
                   version, started_at, last_updated, completed_at, last_error
            FROM sagas
            WHERE correlation_id = $1
            "#,
        )
        .bind(correlation_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_saga).transpose()
    }

    async fn record_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn unprocessed_outbox_count(&self) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM outbox_events WHERE processed = FALSE")
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn saga_counts_by_state(&self) -> Result<HashMap<String, u64>> {
        let rows = sqlx::query(
            "SELECT current_state, COUNT(*) AS count FROM sagas GROUP BY current_state",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = HashMap::new();
        for row in rows {
            let state: String = row.try_get("current_state")?;
            let count: i64 = row.try_get("count")?;
            counts.insert(state, count as u64);
        }
        Ok(counts)
    }

    async fn recent_outbox(&self, limit: usize) -> Result<Vec<OutboxRow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_type, payload, scheduled_for, processed, processed_at,
                   retry_count, last_error, seq, enqueued_at
            FROM outbox_events
            ORDER BY seq DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_outbox).collect()
    }
}

#[async_trait]
impl StoreTransaction for PostgresTx {
    async fn insert_record(&mut self, record: &Record) -> Result<()> {
        let step_data = serde_json::to_value(&record.step_data)?;

        sqlx::query(
            r#"
            INSERT INTO records (id, step_data, received_at)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(step_data)
        .bind(record.received_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.is_unique_violation()
            {
                return StoreError::DuplicateKey(record.id);
            }
            StoreError::Database(e)
        })?;

        Ok(())
    }

    async fn enqueue_outbox(
        &mut self,
        event_type: &str,
        payload: &[u8],
        scheduled_for: DateTime<Utc>,
    ) -> Result<OutboxId> {
        let id = OutboxId::new();

        sqlx::query(
            r#"
            INSERT INTO outbox_events (id, event_type, payload, scheduled_for, enqueued_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(id.as_uuid())
        .bind(event_type)
        .bind(payload)
        .bind(scheduled_for)
        .bind(Utc::now())
        .execute(&mut *self.tx)
        .await?;

        Ok(id)
    }

    async fn save_saga(
        &mut self,
        instance: &SagaInstance,
        expected_version: Version,
    ) -> Result<()> {
        let record_json = serde_json::to_value(&instance.original_record)?;
        let steps_json = serde_json::to_value(&instance.steps)?;
        let new_version = expected_version.next();

        let rows_affected = if expected_version == Version::initial() {
            sqlx::query(
                r#"
                INSERT INTO sagas (correlation_id, workflow, current_state, original_record,
                                   steps, version, started_at, last_updated, completed_at, last_error)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (correlation_id) DO NOTHING
                "#,
            )
            .bind(instance.correlation_id.as_uuid())
            .bind(&instance.workflow)
            .bind(&instance.current_state)
            .bind(record_json)
            .bind(steps_json)
            .bind(new_version.as_i64())
            .bind(instance.started_at)
            .bind(instance.last_updated)
            .bind(instance.completed_at)
            .bind(&instance.last_error)
            .execute(&mut *self.tx)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                r#"
                UPDATE sagas
                SET current_state = $3, steps = $4, version = $5,
                    last_updated = $6, completed_at = $7, last_error = $8
                WHERE correlation_id = $1 AND version = $2
                "#,
            )
            .bind(instance.correlation_id.as_uuid())
            .bind(expected_version.as_i64())
            .bind(&instance.current_state)
            .bind(steps_json)
            .bind(new_version.as_i64())
            .bind(instance.last_updated)
            .bind(instance.completed_at)
            .bind(&instance.last_error)
            .execute(&mut *self.tx)
            .await?
            .rows_affected()
        };

        if rows_affected == 0 {
            let actual: Option<i64> =
                sqlx::query_scalar("SELECT version FROM sagas WHERE correlation_id = $1")
                    .bind(instance.correlation_id.as_uuid())
                    .fetch_optional(&mut *self.tx)
                    .await?;

            return Err(StoreError::ConcurrencyConflict {
                correlation_id: instance.correlation_id,
                expected: expected_version,
                actual: actual.map(Version::new).unwrap_or_else(Version::initial),
            });
        }

        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
