//! Persistent storage for the saga engine.
//!
//! Three durable entities (inbound [`Record`]s, [`OutboxRow`]s, and
//! [`SagaInstance`]s) behind a single [`SagaStore`] trait with one
//! transaction primitive. The transaction is what lets Ingress co-commit a
//! record with its `SagaStarted` outbox row, and the saga engine co-commit a
//! state change with the commands it publishes.
//!
//! Two implementations are provided: [`PostgresStore`] for production and
//! [`InMemoryStore`] with identical semantics for tests.

mod error;
mod instance;
mod memory;
mod outbox;
mod postgres;
mod record;
mod store;

pub use error::{Result, StoreError};
pub use instance::{FINAL_STATE, SagaInstance, StepProgress, Version};
pub use memory::InMemoryStore;
pub use outbox::OutboxRow;
pub use postgres::PostgresStore;
pub use record::Record;
pub use store::{SagaStore, StoreTransaction};
