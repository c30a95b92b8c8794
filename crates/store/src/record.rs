use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common::CorrelationId;

/// An inbound record consumed from the message source.
///
/// `id` doubles as the saga correlation ID, and `step_data` maps a step's
/// message key (e.g. `"order-created"`) to the opaque JSON payload that step
/// will send to its external endpoint. Records are created by ingress and
/// never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Unique record ID; reused verbatim as the saga correlation ID.
    pub id: CorrelationId,

    /// Per-step payloads, keyed by the step's message key.
    pub step_data: HashMap<String, serde_json::Value>,

    /// When ingress first saw this record.
    pub received_at: DateTime<Utc>,
}

impl Record {
    /// Creates a record with the given ID and step payloads.
    pub fn new(id: CorrelationId, step_data: HashMap<String, serde_json::Value>) -> Self {
        Self {
            id,
            step_data,
            received_at: Utc::now(),
        }
    }

    /// Returns the payload for a step's message key.
    ///
    /// An absent key yields an empty JSON object; the downstream HTTP call is
    /// still made and subject to normal success/failure handling.
    pub fn step_payload(&self, message_key: &str) -> serde_json::Value {
        self.step_data
            .get(message_key)
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}))
    }
}
