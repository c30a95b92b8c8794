//! Static workflow descriptors.
//!
//! A workflow is declared as data: a name plus an ordered vector of step
//! descriptors. Event type strings, state names, and the transition table
//! all derive from the descriptors.

use std::time::Duration;

use store::FINAL_STATE;

/// One remote call in a saga: its name, the `step_data` key its payload is
/// extracted from, and its retry/timeout budget.
#[derive(Debug, Clone)]
pub struct StepDescriptor {
    /// Step name, e.g. `"CreateOrder"`. Used in event types and state names.
    pub name: &'static str,

    /// Key into `Record::step_data` for this step's payload.
    pub message_key: &'static str,

    /// Failed attempts allowed before the saga finalizes as failed.
    pub max_retries: u32,

    /// Bound on the step's HTTP call.
    pub timeout: Duration,
}

impl StepDescriptor {
    /// Event type of the command that triggers this step's HTTP call.
    pub fn command_event_type(&self) -> String {
        format!("Call{}", self.name)
    }

    /// Event type published when the step's HTTP call returns 2xx.
    pub fn succeeded_event_type(&self) -> String {
        format!("{}Succeeded", self.name)
    }

    /// Event type published when the step's HTTP call fails.
    pub fn failed_event_type(&self) -> String {
        format!("{}Failed", self.name)
    }

    /// Name of the state in which the saga waits for this step's outcome.
    pub fn awaiting_state(&self) -> String {
        format!("Awaiting{}", self.name)
    }
}

/// Where a saga is in its lifecycle: waiting on one step, or done.
///
/// `Final` is absorbing; late events for a finalized saga are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaPhase {
    /// Waiting for the outcome of the step at this index.
    Awaiting(usize),
    /// Terminal, for success and failure alike.
    Final,
}

/// What an incoming event means to a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The workflow's initial event.
    Started,
    /// Success outcome for the step at this index.
    Succeeded(usize),
    /// Failure outcome for the step at this index.
    Failed(usize),
}

/// A declared workflow: a linear pipeline of steps.
#[derive(Debug, Clone)]
pub struct SagaDefinition {
    /// Workflow name, e.g. `"OrderProcessing"`.
    pub workflow: &'static str,

    steps: Vec<StepDescriptor>,
}

impl SagaDefinition {
    /// Creates a definition. A workflow has at least one step.
    pub fn new(workflow: &'static str, steps: Vec<StepDescriptor>) -> Self {
        assert!(!steps.is_empty(), "a workflow needs at least one step");
        Self { workflow, steps }
    }

    /// Event type of the workflow's initial event.
    pub fn started_event_type(&self) -> String {
        format!("{}SagaStarted", self.workflow)
    }

    /// The declared steps, in execution order.
    pub fn steps(&self) -> &[StepDescriptor] {
        &self.steps
    }

    /// The descriptor at a step index.
    pub fn step(&self, index: usize) -> &StepDescriptor {
        &self.steps[index]
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Always false; kept for the usual pairing with [`len`](Self::len).
    pub fn is_empty(&self) -> bool {
        false
    }

    /// True if the given index is the last step.
    pub fn is_last_step(&self, index: usize) -> bool {
        index + 1 == self.steps.len()
    }

    /// State name for a phase.
    pub fn state_name(&self, phase: SagaPhase) -> String {
        match phase {
            SagaPhase::Awaiting(index) => self.steps[index].awaiting_state(),
            SagaPhase::Final => FINAL_STATE.to_string(),
        }
    }

    /// Parses a persisted state name back into a phase.
    pub fn phase_of(&self, state: &str) -> Option<SagaPhase> {
        if state == FINAL_STATE {
            return Some(SagaPhase::Final);
        }
        self.steps
            .iter()
            .position(|s| s.awaiting_state() == state)
            .map(SagaPhase::Awaiting)
    }

    /// Classifies an event type against this workflow's taxonomy.
    pub fn classify(&self, event_type: &str) -> Option<EventKind> {
        if event_type == self.started_event_type() {
            return Some(EventKind::Started);
        }
        for (index, step) in self.steps.iter().enumerate() {
            if event_type == step.succeeded_event_type() {
                return Some(EventKind::Succeeded(index));
            }
            if event_type == step.failed_event_type() {
                return Some(EventKind::Failed(index));
            }
        }
        None
    }

    /// Every event type the saga engine subscribes to for this workflow.
    pub fn engine_event_types(&self) -> Vec<String> {
        let mut types = vec![self.started_event_type()];
        for step in &self.steps {
            types.push(step.succeeded_event_type());
            types.push(step.failed_event_type());
        }
        types
    }
}
