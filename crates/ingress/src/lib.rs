//! Ingress: the transactional handoff from the message source to the saga
//! engine.
//!
//! For every record the source yields, ingress commits the record and its
//! `SagaStarted` outbox row in one store transaction, acknowledges the source
//! only after commit, and then best-effort publishes the event immediately so
//! the saga usually starts without waiting for the relay's next poll.
//!
//! Redelivery is benign by construction: the record's ID is the saga
//! correlation ID, so a redelivered record hits the duplicate check and is
//! acknowledged without starting a second saga.

mod source;
mod worker;

pub use source::{ChannelSource, ChannelSourceHandle, MessageSource};
pub use worker::{IngressError, IngressWorker};
