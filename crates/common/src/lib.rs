//! Shared identifier types used across the saga engine crates.

mod types;

pub use types::{CorrelationId, OutboxId};
