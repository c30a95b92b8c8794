use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use common::CorrelationId;

use crate::Record;

/// Name of the absorbing terminal state shared by every workflow.
pub const FINAL_STATE: &str = "Final";

/// Version number for a saga instance, used for optimistic concurrency
/// control.
///
/// Versions start at 1 on first save and increment by 1 on every subsequent
/// save of the same instance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the initial version (0) for an instance that has never been
    /// saved.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw version value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Version> for i64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

/// Per-step progress tracked inside a saga instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepProgress {
    /// Step name, matching the saga definition.
    pub name: String,

    /// Failed attempts so far; never exceeds the step's retry budget.
    pub retry_count: u32,

    /// Flips `false → true` exactly once, on the step's success event.
    pub api_called: bool,

    /// Response body from the successful call.
    pub response: Option<String>,
}

impl StepProgress {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            retry_count: 0,
            api_called: false,
            response: None,
        }
    }
}

/// A persistent, per-correlation-ID saga advancing through a fixed sequence
/// of steps.
///
/// Instances are created lazily on the first `SagaStarted` event for a
/// correlation ID, mutated in place by the saga engine under optimistic
/// concurrency, and retained for audit after finalization. Success and
/// failure terminals are distinguishable: success sets `completed_at`,
/// failure leaves it unset and populates `last_error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaInstance {
    /// Primary key; equals the inbound record's ID.
    pub correlation_id: CorrelationId,

    /// Workflow name, e.g. `"OrderProcessing"`.
    pub workflow: String,

    /// One of the workflow's declared states, or `"Final"`.
    pub current_state: String,

    /// The record that started this saga; step payloads are extracted from it.
    pub original_record: Record,

    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,

    /// Set only on the terminal success path.
    pub completed_at: Option<DateTime<Utc>>,

    /// Most recent step error, retained on the failure terminal.
    pub last_error: Option<String>,

    /// One progress block per declared step, in step order.
    pub steps: Vec<StepProgress>,

    /// Optimistic-concurrency version; managed by the store.
    pub version: Version,
}

impl SagaInstance {
    /// Returns the progress block for a step by name.
    pub fn step(&self, name: &str) -> Option<&StepProgress> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Returns the mutable progress block for a step by name.
    pub fn step_mut(&mut self, name: &str) -> Option<&mut StepProgress> {
        self.steps.iter_mut().find(|s| s.name == name)
    }

    /// True once the saga reached its absorbing terminal state.
    pub fn is_final(&self) -> bool {
        self.current_state == FINAL_STATE
    }
}
