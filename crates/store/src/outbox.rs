use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common::OutboxId;

/// A durable record of an intent-to-publish, committed in the same
/// transaction as the business state change that produced it.
///
/// Rows are insert-only except for the relay-managed fields (`processed`,
/// `processed_at`, `retry_count`, `last_error`, `scheduled_for`). A row with
/// `processed = true` is immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRow {
    pub id: OutboxId,

    /// Event type used to route the payload on the dispatcher.
    pub event_type: String,

    /// Serialized event envelope, published verbatim by the relay.
    pub payload: Vec<u8>,

    /// Earliest time the relay may claim this row. Advances monotonically on
    /// each failed attempt.
    pub scheduled_for: DateTime<Utc>,

    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,

    /// Number of failed publish attempts so far. Monotonically non-decreasing.
    pub retry_count: u32,

    /// Error from the most recent failed attempt. Retained on dead-lettered
    /// rows, cleared when a row is eventually published.
    pub last_error: Option<String>,

    /// Insertion-order sequence; stable tie-break for claims with equal
    /// `scheduled_for`. Assigned by the store on commit.
    pub seq: i64,

    pub enqueued_at: DateTime<Utc>,
}

impl OutboxRow {
    /// Creates an unprocessed row ready to be staged in a transaction.
    pub fn new(event_type: impl Into<String>, payload: Vec<u8>, scheduled_for: DateTime<Utc>) -> Self {
        Self {
            id: OutboxId::new(),
            event_type: event_type.into(),
            payload,
            scheduled_for,
            processed: false,
            processed_at: None,
            retry_count: 0,
            last_error: None,
            seq: 0,
            enqueued_at: Utc::now(),
        }
    }

    /// True if the row exhausted its retry budget and will never be
    /// published again.
    pub fn is_dead_lettered(&self) -> bool {
        self.processed && self.last_error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_row_is_unprocessed() {
        let row = OutboxRow::new("SagaStarted", vec![1, 2, 3], Utc::now());
        assert!(!row.processed);
        assert!(row.processed_at.is_none());
        assert_eq!(row.retry_count, 0);
        assert!(!row.is_dead_lettered());
    }

    #[test]
    fn dead_letter_requires_processed_and_error() {
        let mut row = OutboxRow::new("SagaStarted", vec![], Utc::now());
        row.last_error = Some("boom".to_string());
        assert!(!row.is_dead_lettered());

        row.processed = true;
        assert!(row.is_dead_lettered());
    }
}
