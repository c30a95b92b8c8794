//! PostgreSQL integration tests
//!
//! These tests run serially with a single shared PostgreSQL container.
//! The container is automatically cleaned up when the test process exits.
//!
//! Run with:
//!
//! ```bash
//! cargo test -p store --test postgres_integration
//! ```

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, ImageExt, core::IntoContainerPort, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

use common::CorrelationId;
use store::{
    PostgresStore, Record, SagaInstance, SagaStore, StepProgress, StoreError, StoreTransaction,
    Version,
};

/// Container and connection string - initialized once, lives for entire test run
struct TestContainer {
    #[allow(dead_code)] // Container must stay alive for connection to work
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global container - OnceCell ensures single async initialization
static TEST_CONTAINER: OnceCell<Arc<TestContainer>> = OnceCell::const_new();

/// Store container ID for cleanup at exit
static CONTAINER_ID: OnceLock<String> = OnceLock::new();

/// Cleanup function that runs when the test process exits
#[ctor::dtor]
fn cleanup_container() {
    if let Some(container_id) = CONTAINER_ID.get() {
        // Use docker CLI to remove the container since we can't use async here
        let _ = std::process::Command::new("docker")
            .args(["rm", "-f", container_id])
            .output();
    }
}

/// Get the shared container (async, initializes on first call)
async fn get_container() -> Arc<TestContainer> {
    TEST_CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default()
                .with_tag("18-alpine")
                .start()
                .await
                .expect("Failed to start PostgreSQL container");

            // Store container ID for cleanup at exit
            let container_id = container.id().to_string();
            let _ = CONTAINER_ID.set(container_id);

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432.tcp()).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            // Run migrations
            let pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/0001_create_saga_tables.sql"
            ))
            .execute(&pool)
            .await
            .unwrap();
            pool.close().await;

            Arc::new(TestContainer {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh store with cleared tables
async fn get_test_store() -> PostgresStore {
    let container = get_container().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(std::time::Duration::from_secs(10))
        .connect(&container.connection_string)
        .await
        .unwrap();

    // Clear tables for test isolation
    sqlx::query("TRUNCATE TABLE records, outbox_events, sagas")
        .execute(&pool)
        .await
        .unwrap();

    PostgresStore::new(pool)
}

fn create_record(id: CorrelationId) -> Record {
    Record::new(
        id,
        HashMap::from([("order-created".to_string(), serde_json::json!({"o": 1}))]),
    )
}

fn create_instance(id: CorrelationId) -> SagaInstance {
    SagaInstance {
        correlation_id: id,
        workflow: "OrderProcessing".to_string(),
        current_state: "AwaitingCreateOrder".to_string(),
        original_record: create_record(id),
        started_at: Utc::now(),
        last_updated: Utc::now(),
        completed_at: None,
        last_error: None,
        steps: vec![
            StepProgress::new("CreateOrder"),
            StepProgress::new("ProcessOrder"),
            StepProgress::new("ShipOrder"),
        ],
        version: Version::initial(),
    }
}

#[tokio::test]
#[serial]
async fn insert_record_then_duplicate() {
    let store = get_test_store().await;
    let id = CorrelationId::new();

    let mut tx = store.begin().await.unwrap();
    tx.insert_record(&create_record(id)).await.unwrap();
    tx.commit().await.unwrap();

    let mut tx = store.begin().await.unwrap();
    let err = tx.insert_record(&create_record(id)).await.unwrap_err();
    assert!(matches!(err, StoreError::DuplicateKey(dup) if dup == id));
    // Commit-empty after the duplicate, the way ingress does.
    tx.commit().await.unwrap();

    assert_eq!(store.record_count().await.unwrap(), 1);
}

#[tokio::test]
#[serial]
async fn record_and_outbox_commit_atomically() {
    let store = get_test_store().await;
    let id = CorrelationId::new();

    let mut tx = store.begin().await.unwrap();
    tx.insert_record(&create_record(id)).await.unwrap();
    tx.enqueue_outbox("OrderProcessingSagaStarted", b"{}", Utc::now())
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(store.record_count().await.unwrap(), 1);
    assert_eq!(store.unprocessed_outbox_count().await.unwrap(), 1);
}

#[tokio::test]
#[serial]
async fn rollback_discards_staged_writes() {
    let store = get_test_store().await;
    let id = CorrelationId::new();

    let mut tx = store.begin().await.unwrap();
    tx.insert_record(&create_record(id)).await.unwrap();
    tx.enqueue_outbox("OrderProcessingSagaStarted", b"{}", Utc::now())
        .await
        .unwrap();
    tx.rollback().await.unwrap();

    assert_eq!(store.record_count().await.unwrap(), 0);
    assert_eq!(store.unprocessed_outbox_count().await.unwrap(), 0);
}

#[tokio::test]
#[serial]
async fn claim_respects_scheduled_for_and_order() {
    let store = get_test_store().await;
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
#[serial]
async fn claimed_rows_are_not_handed_out_twice() {
    let store = get_test_store().await;
    let now = Utc::now();

    let mut tx = store.begin().await.unwrap();
    let id = tx.enqueue_outbox("A", b"a", now).await.unwrap();
    tx.commit().await.unwrap();

    let first = store.claim_due_outbox(now, 10).await.unwrap();
    assert_eq!(first.len(), 1);

    // The claim is durable past the statement, not just a row lock.
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
#[serial]
async fn concurrent_claims_never_overlap() {
    let store = get_test_store().await;
    let now = Utc::now();

    let mut tx = store.begin().await.unwrap();
    for n in 0..20 {
        tx.enqueue_outbox("A", format!("{n}").as_bytes(), now)
            .await
            .unwrap();
    }
    tx.commit().await.unwrap();

    let (a, b) = tokio::join!(
        store.claim_due_outbox(now, 10),
        store.claim_due_outbox(now, 10)
    );
    let a = a.unwrap();
    let b = b.unwrap();

    assert!(!a.is_empty());
    assert!(!b.is_empty());
    for row in &a {
        assert!(
            !b.iter().any(|other| other.id == row.id),
            "row {} claimed by both callers",
            row.id
        );
    }
    assert_eq!(a.len() + b.len(), 20);
}

#[tokio::test]
#[serial]
async fn mark_processed_retires_row() {
    let store = get_test_store().await;
    let now = Utc::now();

    let mut tx = store.begin().await.unwrap();
    let id = tx.enqueue_outbox("A", b"a", now).await.unwrap();
    tx.commit().await.unwrap();

    store.claim_due_outbox(now, 10).await.unwrap();
    store.mark_failed(id, "transient", now, 1).await.unwrap();
    store.claim_due_outbox(now, 10).await.unwrap();
    store.mark_processed(id).await.unwrap();

    assert_eq!(store.unprocessed_outbox_count().await.unwrap(), 0);
    let rows = store.recent_outbox(10).await.unwrap();
    assert!(rows[0].processed);
    assert!(rows[0].processed_at.is_some());
    assert!(rows[0].last_error.is_none());
    assert!(!rows[0].is_dead_lettered());

    // Processed rows are never claimed again.
    assert!(store.claim_due_outbox(now, 10).await.unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn dead_lettered_row_is_distinguishable() {
    let store = get_test_store().await;
    let now = Utc::now();

    let mut tx = store.begin().await.unwrap();
    let id = tx.enqueue_outbox("A", b"a", now).await.unwrap();
    tx.commit().await.unwrap();

    store.claim_due_outbox(now, 10).await.unwrap();
    store.mark_dead_lettered(id, "gave up", 5).await.unwrap();

    let rows = store.recent_outbox(10).await.unwrap();
    assert!(rows[0].is_dead_lettered());
    assert_eq!(rows[0].retry_count, 5);
    assert_eq!(rows[0].last_error.as_deref(), Some("gave up"));

    assert!(store.claim_due_outbox(now, 10).await.unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn save_and_load_saga_roundtrip() {
    let store = get_test_store().await;
    let id = CorrelationId::new();

    let mut instance = create_instance(id);
    instance.step_mut("ProcessOrder").unwrap().retry_count = 2;
    instance.last_error = Some("HTTP 500".to_string());

    let mut tx = store.begin().await.unwrap();
    tx.save_saga(&instance, Version::initial()).await.unwrap();
    tx.commit().await.unwrap();

    let loaded = store.load_saga(id).await.unwrap().unwrap();
    assert_eq!(loaded.correlation_id, id);
    assert_eq!(loaded.workflow, "OrderProcessing");
    assert_eq!(loaded.current_state, "AwaitingCreateOrder");
    assert_eq!(loaded.version, Version::new(1));
    assert_eq!(loaded.step("ProcessOrder").unwrap().retry_count, 2);
    assert_eq!(loaded.last_error.as_deref(), Some("HTTP 500"));
    assert_eq!(
        loaded.original_record.step_data.get("order-created"),
        Some(&serde_json::json!({"o": 1}))
    );
}

#[tokio::test]
#[serial]
async fn save_saga_advances_version_on_update() {
    let store = get_test_store().await;
    let id = CorrelationId::new();

    let mut tx = store.begin().await.unwrap();
    tx.save_saga(&create_instance(id), Version::initial())
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut updated = store.load_saga(id).await.unwrap().unwrap();
    updated.current_state = "AwaitingProcessOrder".to_string();
    updated.step_mut("CreateOrder").unwrap().api_called = true;

    let mut tx = store.begin().await.unwrap();
    tx.save_saga(&updated, updated.version).await.unwrap();
    tx.commit().await.unwrap();

    let loaded = store.load_saga(id).await.unwrap().unwrap();
    assert_eq!(loaded.version, Version::new(2));
    assert_eq!(loaded.current_state, "AwaitingProcessOrder");
    assert!(loaded.step("CreateOrder").unwrap().api_called);
}

#[tokio::test]
#[serial]
async fn save_saga_conflict_on_stale_version() {
    let store = get_test_store().await;
    let id = CorrelationId::new();

    let mut tx = store.begin().await.unwrap();
    tx.save_saga(&create_instance(id), Version::initial())
        .await
        .unwrap();
    tx.commit().await.unwrap();

    // Stale writer still believes the saga is unsaved.
    let mut tx = store.begin().await.unwrap();
    let err = tx
        .save_saga(&create_instance(id), Version::initial())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::ConcurrencyConflict {
            expected,
            actual,
            ..
        } if expected == Version::initial() && actual == Version::new(1)
    ));
    tx.rollback().await.unwrap();

    // Stale update loses the same way.
    let mut tx = store.begin().await.unwrap();
    let err = tx
        .save_saga(&create_instance(id), Version::new(7))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ConcurrencyConflict { .. }));
    tx.rollback().await.unwrap();

    let loaded = store.load_saga(id).await.unwrap().unwrap();
    assert_eq!(loaded.version, Version::new(1));
}

#[tokio::test]
#[serial]
async fn load_saga_not_found() {
    let store = get_test_store().await;
    let result = store.load_saga(CorrelationId::new()).await.unwrap();
    assert!(result.is_none());
}

#[tokio::test]
#[serial]
async fn saga_counts_group_by_state() {
    let store = get_test_store().await;

    for state in ["AwaitingCreateOrder", "AwaitingCreateOrder", "Final"] {
        let mut instance = create_instance(CorrelationId::new());
        instance.current_state = state.to_string();
        let mut tx = store.begin().await.unwrap();
        tx.save_saga(&instance, Version::initial()).await.unwrap();
        tx.commit().await.unwrap();
    }

    let counts = store.saga_counts_by_state().await.unwrap();
    assert_eq!(counts.get("AwaitingCreateOrder"), Some(&2));
    assert_eq!(counts.get("Final"), Some(&1));
}

#[tokio::test]
#[serial]
async fn recent_outbox_returns_newest_first() {
    let store = get_test_store().await;
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

#[tokio::test]
#[serial]
async fn payload_bytes_survive_storage_verbatim() {
    let store = get_test_store().await;
    let now = Utc::now();
    let payload = serde_json::to_vec(&serde_json::json!({
        "event_type": "OrderProcessingSagaStarted",
        "correlation_id": CorrelationId::new(),
        "payload": {"k": [1, 2, 3]}
    }))
    .unwrap();

    let mut tx = store.begin().await.unwrap();
    tx.enqueue_outbox("OrderProcessingSagaStarted", &payload, now)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let claimed = store.claim_due_outbox(now, 1).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].payload, payload);
}
