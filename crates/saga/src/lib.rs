//! Per-correlation saga state machine.
//!
//! A saga definition is a vector of static step descriptors; the engine
//! subscribes to the workflow's events on the dispatcher and, for each event,
//! runs one load → apply → save cycle under optimistic concurrency,
//! co-committing any outbound commands to the transactional outbox.
//!
//! The reference workflow is [`order_processing`]: create → process → ship,
//! each step an HTTP call with its own payload key, timeout, and retry budget.

pub mod definition;
pub mod engine;
pub mod error;
pub mod events;
pub mod order_processing;

pub use definition::{EventKind, SagaDefinition, SagaPhase, StepDescriptor};
pub use engine::SagaEngine;
pub use error::SagaError;
pub use events::{SagaStarted, StepCommand, StepFailed, StepSucceeded};
