//! The saga engine: one dispatcher handler per workflow.
//!
//! Every event runs a single load → apply → save cycle. Outbound commands
//! are enqueued to the outbox in the same transaction as the saga save, then
//! best-effort published immediately; the relay covers the case where the
//! process dies in between.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use common::OutboxId;
use dispatcher::{DispatchError, Dispatcher, EventEnvelope, EventHandler};
use store::{SagaInstance, SagaStore, StepProgress, StoreError, StoreTransaction, Version};

use crate::definition::{EventKind, SagaDefinition, SagaPhase};
use crate::error::{Result, SagaError};
use crate::events::{SagaStarted, StepCommand, StepFailed, StepSucceeded};

/// Default bound on optimistic-concurrency retries per handler invocation.
const DEFAULT_CONFLICT_RETRIES: u32 = 5;

/// Default pause between conflict retries.
const DEFAULT_CONFLICT_BACKOFF: Duration = Duration::from_millis(25);

/// Drives one workflow's sagas in response to dispatcher events.
pub struct SagaEngine<S: SagaStore> {
    store: S,
    dispatcher: Dispatcher,
    definition: Arc<SagaDefinition>,
    conflict_retries: u32,
    conflict_backoff: Duration,
}

/// Result of applying one event to a loaded (or new) instance.
struct Applied {
    saga: SagaInstance,
    expected_version: Version,
    emits: Vec<EventEnvelope>,
}

impl<S> SagaEngine<S>
where
    S: SagaStore + Clone + 'static,
{
    /// Creates an engine for the given workflow.
    pub fn new(store: S, dispatcher: Dispatcher, definition: Arc<SagaDefinition>) -> Self {
        Self {
            store,
            dispatcher,
            definition,
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
            conflict_backoff: DEFAULT_CONFLICT_BACKOFF,
        }
    }

    /// Overrides the optimistic-concurrency retry policy.
    pub fn with_conflict_policy(mut self, retries: u32, backoff: Duration) -> Self {
        self.conflict_retries = retries.max(1);
        self.conflict_backoff = backoff;
        self
    }

    /// Subscribes this engine to every event type in its workflow's taxonomy.
    pub fn register(self: &Arc<Self>) {
        for event_type in self.definition.engine_event_types() {
            self.dispatcher.subscribe(event_type, self.clone());
        }
    }

    /// Processes one event, retrying the whole load → apply → save cycle on
    /// concurrency conflicts.
    #[tracing::instrument(skip(self, event), fields(event_type = %event.event_type, correlation_id = %event.correlation_id))]
    async fn process(&self, kind: EventKind, event: &EventEnvelope) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.try_once(kind, event).await {
                Err(SagaError::Store(StoreError::ConcurrencyConflict { .. })) => {
                    attempt += 1;
                    metrics::counter!("saga_conflict_retries_total").increment(1);
                    if attempt >= self.conflict_retries {
                        tracing::warn!(attempts = attempt, "concurrency retries exhausted");
                        return Err(SagaError::ConflictRetriesExhausted(event.correlation_id));
                    }
                    tracing::debug!(attempt, "concurrency conflict, reloading saga");
                    tokio::time::sleep(self.conflict_backoff).await;
                }
                other => return other,
            }
        }
    }

    async fn try_once(&self, kind: EventKind, event: &EventEnvelope) -> Result<()> {
        let existing = self.store.load_saga(event.correlation_id).await?;

        let Some(applied) = self.apply(kind, event, existing)? else {
            return Ok(());
        };

        let mut tx = self.store.begin().await?;
        tx.save_saga(&applied.saga, applied.expected_version).await?;

        let mut enqueued = Vec::with_capacity(applied.emits.len());
        for envelope in &applied.emits {
            let bytes = envelope.to_bytes()?;
            let id = tx
                .enqueue_outbox(&envelope.event_type, &bytes, Utc::now())
                .await?;
            enqueued.push((id, envelope.clone()));
        }
        tx.commit().await?;

        self.spawn_immediate_publish(enqueued);
        Ok(())
    }

    /// Applies the transition table. Returns `None` when the event is dropped
    /// (duplicate start, unexpected-for-state, or late after finalization).
    fn apply(
        &self,
        kind: EventKind,
        event: &EventEnvelope,
        existing: Option<SagaInstance>,
    ) -> Result<Option<Applied>> {
        let now = Utc::now();

        match kind {
            EventKind::Started => {
                if existing.is_some() {
                    self.drop_event(event, "saga already exists for correlation ID");
                    return Ok(None);
                }

                let started: SagaStarted = event.decode()?;
                let saga = SagaInstance {
                    correlation_id: event.correlation_id,
                    workflow: self.definition.workflow.to_string(),
                    current_state: self.definition.state_name(SagaPhase::Awaiting(0)),
                    original_record: started.record,
                    started_at: started.started_at,
                    last_updated: now,
                    completed_at: None,
                    last_error: None,
                    steps: self
                        .definition
                        .steps()
                        .iter()
                        .map(|s| StepProgress::new(s.name))
                        .collect(),
                    version: Version::initial(),
                };

                let command = self.command_envelope(&saga, 0, 0)?;
                metrics::counter!("saga_started_total").increment(1);
                tracing::info!(workflow = self.definition.workflow, "saga started");

                Ok(Some(Applied {
                    saga,
                    expected_version: Version::initial(),
                    emits: vec![command],
                }))
            }

            EventKind::Succeeded(index) => {
                let Some(mut saga) = existing else {
                    self.drop_event(event, "no saga for correlation ID");
                    return Ok(None);
                };
                if !self.awaiting(&saga, index) {
                    self.drop_event(event, "unexpected event for state");
                    return Ok(None);
                }

                let outcome: StepSucceeded = event.decode()?;
                let expected_version = saga.version;
                let step_name = self.definition.step(index).name;

                if let Some(progress) = saga.step_mut(step_name) {
                    progress.api_called = true;
                    progress.response = Some(outcome.response);
                }
                saga.last_updated = now;

                let emits = if self.definition.is_last_step(index) {
                    saga.current_state = self.definition.state_name(SagaPhase::Final);
                    saga.completed_at = Some(now);
                    metrics::counter!("saga_completed").increment(1);
                    tracing::info!(workflow = self.definition.workflow, "saga completed");
                    Vec::new()
                } else {
                    saga.current_state = self.definition.state_name(SagaPhase::Awaiting(index + 1));
                    vec![self.command_envelope(&saga, index + 1, 0)?]
                };

                Ok(Some(Applied {
                    saga,
                    expected_version,
                    emits,
                }))
            }

            EventKind::Failed(index) => {
                let Some(mut saga) = existing else {
                    self.drop_event(event, "no saga for correlation ID");
                    return Ok(None);
                };
                if !self.awaiting(&saga, index) {
                    self.drop_event(event, "unexpected event for state");
                    return Ok(None);
                }

                let outcome: StepFailed = event.decode()?;
                let expected_version = saga.version;
                let step = self.definition.step(index);

                saga.last_error = Some(outcome.error);
                saga.last_updated = now;

                let retry_count = saga.step(step.name).map(|p| p.retry_count).unwrap_or(0);
                let emits = if retry_count < step.max_retries {
                    let next_retry = retry_count + 1;
                    if let Some(progress) = saga.step_mut(step.name) {
                        progress.retry_count = next_retry;
                    }
                    tracing::warn!(
                        step = step.name,
                        retry = next_retry,
                        max_retries = step.max_retries,
                        "step failed, retrying"
                    );
                    vec![self.command_envelope(&saga, index, next_retry)?]
                } else {
                    saga.current_state = self.definition.state_name(SagaPhase::Final);
                    metrics::counter!("saga_failed").increment(1);
                    tracing::warn!(
                        step = step.name,
                        retries = retry_count,
                        "retry budget exhausted, saga failed"
                    );
                    Vec::new()
                };

                Ok(Some(Applied {
                    saga,
                    expected_version,
                    emits,
                }))
            }
        }
    }

    fn awaiting(&self, saga: &SagaInstance, index: usize) -> bool {
        self.definition.phase_of(&saga.current_state) == Some(SagaPhase::Awaiting(index))
    }

    /// Builds the command envelope for a step, extracting its payload from
    /// the original record.
    fn command_envelope(
        &self,
        saga: &SagaInstance,
        index: usize,
        retry_count: u32,
    ) -> Result<EventEnvelope> {
        let step = self.definition.step(index);
        let command = StepCommand {
            correlation_id: saga.correlation_id,
            step: step.name.to_string(),
            payload: saga.original_record.step_payload(step.message_key),
            retry_count,
        };
        Ok(EventEnvelope::new(
            step.command_event_type(),
            saga.correlation_id,
            &command,
        )?)
    }

    /// Publishes freshly committed outbox rows without waiting for the relay,
    /// retiring each row that goes through. Failures are left to the relay.
    fn spawn_immediate_publish(&self, rows: Vec<(OutboxId, EventEnvelope)>) {
        if rows.is_empty() {
            return;
        }
        let store = self.store.clone();
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            for (id, envelope) in rows {
                match dispatcher.publish(envelope).await {
                    Ok(()) => {
                        if let Err(e) = store.mark_processed(id).await {
                            tracing::debug!(outbox_id = %id, error = %e, "could not retire outbox row");
                        }
                    }
                    Err(e) => {
                        tracing::debug!(
                            outbox_id = %id,
                            error = %e,
                            "immediate publish failed, relay will deliver"
                        );
                    }
                }
            }
        });
    }

    fn drop_event(&self, event: &EventEnvelope, reason: &str) {
        metrics::counter!("saga_events_dropped_total").increment(1);
        tracing::warn!(
            event_type = %event.event_type,
            correlation_id = %event.correlation_id,
            reason,
            "dropping event"
        );
    }
}

#[async_trait]
impl<S> EventHandler for SagaEngine<S>
where
    S: SagaStore + Clone + 'static,
{
    async fn handle(&self, event: EventEnvelope) -> std::result::Result<(), DispatchError> {
        let Some(kind) = self.definition.classify(&event.event_type) else {
            return Err(DispatchError::handler(
                &event.event_type,
                SagaError::UnknownEventType(event.event_type.clone()),
            ));
        };

        self.process(kind, &event)
            .await
            .map_err(|e| DispatchError::handler(&event.event_type, e))
    }
}
