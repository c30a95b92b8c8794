use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;

use dispatcher::{Dispatcher, EventEnvelope};
use saga::{SagaDefinition, SagaStarted};
use store::{Record, SagaStore, StoreError, StoreTransaction};

use crate::MessageSource;

/// Errors that can occur while ingesting a record.
#[derive(Debug, Error)]
pub enum IngressError {
    /// Store operation failed; the record stays un-acked for redelivery.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The start event could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Long-running consumer of one message source.
///
/// One worker per source partition preserves the source's ordering; the
/// reference wiring runs a single worker over a single channel source.
pub struct IngressWorker<S: SagaStore, M: MessageSource> {
    store: S,
    dispatcher: Dispatcher,
    definition: Arc<SagaDefinition>,
    source: M,
}

impl<S, M> IngressWorker<S, M>
where
    S: SagaStore,
    M: MessageSource,
{
    pub fn new(store: S, dispatcher: Dispatcher, definition: Arc<SagaDefinition>, source: M) -> Self {
        Self {
            store,
            dispatcher,
            definition,
            source,
        }
    }

    /// Consumes the source until it is exhausted or shutdown is signalled.
    ///
    /// A failed record is logged and left un-acked; the source's redelivery
    /// takes it from there.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                maybe = self.source.recv() => {
                    let Some(record) = maybe else { break };
                    if let Err(e) = self.process(record).await {
                        tracing::error!(error = %e, "record ingestion failed, awaiting redelivery");
                    }
                }
            }
        }
        tracing::info!("ingress worker stopped");
    }

    /// Ingests one record: insert + enqueue in one transaction, ack after
    /// commit, then best-effort immediate publish.
    #[tracing::instrument(skip(self, record), fields(record_id = %record.id))]
    pub async fn process(&mut self, record: Record) -> Result<(), IngressError> {
        metrics::counter!("ingress_records_total").increment(1);
        let correlation_id = record.id;

        let mut tx = self.store.begin().await?;
        match tx.insert_record(&record).await {
            Ok(()) => {}
            Err(StoreError::DuplicateKey(_)) => {
                // Redelivery of an already-committed record: nothing staged,
                // commit-empty and acknowledge.
                tx.commit().await?;
                self.source.ack(correlation_id).await;
                metrics::counter!("ingress_duplicates_total").increment(1);
                tracing::info!("duplicate record, acknowledged without effect");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let started = SagaStarted {
            correlation_id,
            record,
            started_at: Utc::now(),
        };
        let envelope = EventEnvelope::new(
            self.definition.started_event_type(),
            correlation_id,
            &started,
        )?;
        let bytes = envelope.to_bytes()?;
        let outbox_id = tx
            .enqueue_outbox(&envelope.event_type, &bytes, Utc::now())
            .await?;

        tx.commit().await?;

        // The source sees the ack only once the record and its start event
        // are durable.
        self.source.ack(correlation_id).await;
        tracing::info!("record committed with saga start event");

        // Best-effort fast path; on failure the relay delivers the row on its
        // next poll.
        match self.dispatcher.publish(envelope).await {
            Ok(()) => {
                if let Err(e) = self.store.mark_processed(outbox_id).await {
                    tracing::debug!(outbox_id = %outbox_id, error = %e, "could not retire outbox row");
                }
            }
            Err(e) => {
                tracing::debug!(
                    outbox_id = %outbox_id,
                    error = %e,
                    "immediate publish failed, relay will deliver"
                );
            }
        }

        Ok(())
    }
}
