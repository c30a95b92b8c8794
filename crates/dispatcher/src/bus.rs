use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use common::CorrelationId;

use crate::EventEnvelope;

/// Errors surfaced by the dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A subscribed handler rejected the event.
    #[error("handler for '{event_type}' failed: {message}")]
    Handler { event_type: String, message: String },

    /// The dispatcher has been shut down and accepts no new publishes.
    #[error("dispatcher is shut down")]
    Closed,
}

impl DispatchError {
    /// Builds a handler failure from any displayable error.
    pub fn handler(event_type: impl Into<String>, err: impl std::fmt::Display) -> Self {
        DispatchError::Handler {
            event_type: event_type.into(),
            message: err.to_string(),
        }
    }
}

/// A subscriber on the dispatcher.
///
/// Handlers run on the worker owning the event's correlation ID; they must
/// not await a `publish` of an event with the same correlation ID (use
/// [`Dispatcher::publish_detached`] for follow-up events instead).
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: EventEnvelope) -> Result<(), DispatchError>;
}

struct Job {
    event: EventEnvelope,
    ack: oneshot::Sender<Result<(), DispatchError>>,
}

type HandlerMap = HashMap<String, Vec<Arc<dyn EventHandler>>>;

/// Single-process pub/sub bus.
///
/// Routing is keyed by declared event type; ordering is per correlation ID:
/// every event for a correlation lands on the same worker queue, so events a
/// single caller publishes in sequence are delivered to a given handler in
/// publish order. No ordering holds across distinct correlation IDs.
#[derive(Clone)]
pub struct Dispatcher {
    handlers: Arc<RwLock<HandlerMap>>,
    senders: Arc<RwLock<Option<Vec<mpsc::Sender<Job>>>>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Dispatcher {
    /// Creates a dispatcher with `worker_count` delivery workers, each with a
    /// bounded queue of `queue_depth` events.
    pub fn new(worker_count: usize, queue_depth: usize) -> Self {
        let worker_count = worker_count.max(1);
        let handlers: Arc<RwLock<HandlerMap>> = Arc::new(RwLock::new(HashMap::new()));

        let mut senders = Vec::with_capacity(worker_count);
        let mut tasks = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let (tx, rx) = mpsc::channel(queue_depth.max(1));
            senders.push(tx);
            tasks.push(tokio::spawn(worker_loop(rx, handlers.clone())));
        }

        Self {
            handlers,
            senders: Arc::new(RwLock::new(Some(senders))),
            tasks: Arc::new(Mutex::new(tasks)),
        }
    }

    /// Registers a handler for an event type. Handlers for the same type run
    /// in subscription order.
    pub fn subscribe(&self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .unwrap()
            .entry(event_type.into())
            .or_default()
            .push(handler);
    }

    /// Publishes an event and waits until every subscribed handler has run.
    ///
    /// Returns the first handler error, which is how producers with their own
    /// retry (the outbox relay) observe delivery failure. Publishing a type
    /// with no subscribers succeeds.
    pub async fn publish(&self, event: EventEnvelope) -> Result<(), DispatchError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let sender = {
            let senders = self.senders.read().unwrap();
            let Some(senders) = senders.as_ref() else {
                return Err(DispatchError::Closed);
            };
            let idx = worker_index(event.correlation_id, senders.len());
            senders[idx].clone()
        };

        sender
            .send(Job {
                event,
                ack: ack_tx,
            })
            .await
            .map_err(|_| DispatchError::Closed)?;

        ack_rx.await.map_err(|_| DispatchError::Closed)?
    }

    /// Fire-and-forget publish for use inside handlers.
    ///
    /// Delivery failures are logged, not returned; a handler that awaited
    /// delivery of a same-correlation event would deadlock its own worker.
    pub fn publish_detached(&self, event: EventEnvelope) {
        let this = self.clone();
        tokio::spawn(async move {
            let event_type = event.event_type.clone();
            let correlation_id = event.correlation_id;
            if let Err(e) = this.publish(event).await {
                tracing::warn!(
                    %event_type,
                    %correlation_id,
                    error = %e,
                    "detached publish failed"
                );
            }
        });
    }

    /// Stops accepting publishes and drains worker queues, waiting up to
    /// `grace` per worker.
    pub async fn shutdown(&self, grace: Duration) {
        let senders = self.senders.write().unwrap().take();
        drop(senders);

        let mut tasks = self.tasks.lock().await;
        for mut task in tasks.drain(..) {
            if tokio::time::timeout(grace, &mut task).await.is_err() {
                tracing::warn!("dispatcher worker did not drain within grace period, aborting");
                task.abort();
            }
        }
    }
}

async fn worker_loop(mut rx: mpsc::Receiver<Job>, handlers: Arc<RwLock<HandlerMap>>) {
    while let Some(job) = rx.recv().await {
        let subscribed: Vec<Arc<dyn EventHandler>> = {
            let map = handlers.read().unwrap();
            map.get(&job.event.event_type).cloned().unwrap_or_default()
        };

        if subscribed.is_empty() {
            tracing::debug!(
                event_type = %job.event.event_type,
                "no subscribers for event type"
            );
        }

        metrics::counter!("dispatcher_events_total").increment(1);

        let mut result = Ok(());
        for handler in subscribed {
            if let Err(e) = handler.handle(job.event.clone()).await {
                result = Err(e);
                break;
            }
        }

        if result.is_err() {
            metrics::counter!("dispatcher_handler_failures_total").increment(1);
        }

        // The publisher may have gone away; that is fine.
        let _ = job.ack.send(result);
    }
}

fn worker_index(correlation_id: CorrelationId, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    correlation_id.as_uuid().hash(&mut hasher);
    (hasher.finish() as usize) % workers
}
