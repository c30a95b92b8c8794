//! Event payloads exchanged over the dispatcher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common::CorrelationId;
use store::Record;

/// Initial event of every workflow, enqueued by ingress in the same
/// transaction as the record itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaStarted {
    /// Equals the record's ID.
    pub correlation_id: CorrelationId,
    /// The full inbound record; step payloads are extracted from it.
    pub record: Record,
    pub started_at: DateTime<Utc>,
}

/// Command instructing the step executor to issue one HTTP call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepCommand {
    pub correlation_id: CorrelationId,
    /// Step name, matching the workflow definition.
    pub step: String,
    /// JSON body for the HTTP POST.
    pub payload: serde_json::Value,
    /// Which attempt this is; the engine increments it on each re-emit.
    pub retry_count: u32,
}

/// Published by the step executor on HTTP 2xx.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSucceeded {
    pub correlation_id: CorrelationId,
    pub step: String,
    /// Response body, stored verbatim in the saga state.
    pub response: String,
}

/// Published by the step executor on HTTP >= 400, transport error, or
/// timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFailed {
    pub correlation_id: CorrelationId,
    pub step: String,
    pub error: String,
    /// Echo of the triggering command's retry count.
    pub retry_count: u32,
}
