//! Outbox relay: the background worker that makes the outbox durable in
//! practice.
//!
//! On a fixed polling interval the relay claims due rows, publishes each to
//! the dispatcher, and marks it processed. Failures (handler errors and
//! payload deserialization alike) are rescheduled with exponential backoff
//! until the retry budget runs out, at which point the row is dead-lettered:
//! retired with its last error retained for operator inspection.

use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use dispatcher::{Dispatcher, EventEnvelope};
use store::{OutboxRow, Result, SagaStore};

/// Relay tuning knobs.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// How often to poll for due rows.
    pub poll_interval: Duration,
    /// Maximum rows claimed per poll.
    pub batch_size: usize,
    /// Failed attempts before a row is dead-lettered.
    pub max_retries: u32,
    /// First retry delay; doubles on each subsequent failure.
    pub backoff_base: Duration,
    /// Upper bound on any retry delay.
    pub backoff_max: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 50,
            max_retries: 5,
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(60),
        }
    }
}

/// Drains unprocessed outbox rows into the dispatcher.
pub struct OutboxRelay<S: SagaStore> {
    store: S,
    dispatcher: Dispatcher,
    config: RelayConfig,
}

impl<S: SagaStore> OutboxRelay<S> {
    pub fn new(store: S, dispatcher: Dispatcher, config: RelayConfig) -> Self {
        Self {
            store,
            dispatcher,
            config,
        }
    }

    /// Polls until shutdown is signalled. An in-flight batch always finishes
    /// before the relay exits; no new claims are made afterwards.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.drain_due().await {
                        tracing::error!(error = %e, "outbox poll failed");
                    }
                }
            }
        }
        tracing::info!("outbox relay stopped");
    }

    /// Claims one batch of due rows and publishes them in order.
    ///
    /// Returns the number of rows successfully published. An empty outbox
    /// performs no publishes and no writes.
    #[tracing::instrument(skip(self))]
    pub async fn drain_due(&self) -> Result<usize> {
        let now = Utc::now();
        let rows = self.store.claim_due_outbox(now, self.config.batch_size).await?;
        if rows.is_empty() {
            return Ok(0);
        }

        tracing::debug!(claimed = rows.len(), "claimed outbox batch");

        let mut published = 0;
        for row in rows {
            match self.deliver(&row).await {
                Ok(()) => {
                    self.store.mark_processed(row.id).await?;
                    metrics::counter!("outbox_published_total").increment(1);
                    published += 1;
                }
                Err(reason) => self.record_failure(row, reason).await?,
            }
        }
        Ok(published)
    }

    /// Decodes and publishes one row; the error string becomes `last_error`.
    async fn deliver(&self, row: &OutboxRow) -> std::result::Result<(), String> {
        let envelope = EventEnvelope::from_bytes(&row.payload)
            .map_err(|e| format!("payload deserialization failed: {e}"))?;
        self.dispatcher
            .publish(envelope)
            .await
            .map_err(|e| e.to_string())
    }

    async fn record_failure(&self, row: OutboxRow, reason: String) -> Result<()> {
        let retry_count = row.retry_count + 1;

        if retry_count >= self.config.max_retries {
            metrics::counter!("outbox_dead_lettered_total").increment(1);
            tracing::warn!(
                outbox_id = %row.id,
                event_type = %row.event_type,
                retry_count,
                error = %reason,
                "retry budget exhausted, dead-lettering outbox row"
            );
            self.store
                .mark_dead_lettered(row.id, &reason, retry_count)
                .await
        } else {
            let delay = self.backoff(retry_count);
            metrics::counter!("outbox_retries_total").increment(1);
            tracing::warn!(
                outbox_id = %row.id,
                event_type = %row.event_type,
                retry_count,
                delay_secs = delay.as_secs_f64(),
                error = %reason,
                "publish failed, rescheduling outbox row"
            );
            let next = Utc::now()
                + chrono::Duration::from_std(delay)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60));
            self.store
                .mark_failed(row.id, &reason, next, retry_count)
                .await
        }
    }

    /// Exponential backoff: `base * 2^(n-1)`, capped at the configured
    /// maximum.
    fn backoff(&self, retry_count: u32) -> Duration {
        let exp = retry_count.saturating_sub(1).min(16);
        let delay = self.config.backoff_base.saturating_mul(1u32 << exp);
        delay.min(self.config.backoff_max)
    }
}
