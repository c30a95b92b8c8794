use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use common::CorrelationId;
use store::Record;

/// An at-least-once source of inbound records with explicit acknowledgement.
///
/// Ingress acknowledges a record only after its transaction commits; an
/// un-acked record is the source's to redeliver.
#[async_trait]
pub trait MessageSource: Send {
    /// Yields the next record, or `None` when the source is exhausted.
    async fn recv(&mut self) -> Option<Record>;

    /// Acknowledges a handled record.
    async fn ack(&mut self, id: CorrelationId);
}

/// An in-process channel-backed source.
///
/// The reference wiring feeds it from the ingest HTTP endpoint; tests feed it
/// directly and can inspect which records were acknowledged. Redelivery is
/// the producer's job (push the record again).
pub struct ChannelSource {
    rx: mpsc::Receiver<Record>,
    acked: Arc<Mutex<Vec<CorrelationId>>>,
}

/// Producer handle for a [`ChannelSource`].
#[derive(Clone)]
pub struct ChannelSourceHandle {
    tx: mpsc::Sender<Record>,
    acked: Arc<Mutex<Vec<CorrelationId>>>,
}

impl ChannelSource {
    /// Creates a source with the given buffer capacity and its producer
    /// handle.
    pub fn new(capacity: usize) -> (Self, ChannelSourceHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let acked = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                rx,
                acked: acked.clone(),
            },
            ChannelSourceHandle { tx, acked },
        )
    }
}

impl ChannelSourceHandle {
    /// Submits a record for ingestion. Returns `false` if the source side is
    /// gone.
    pub async fn push(&self, record: Record) -> bool {
        self.tx.send(record).await.is_ok()
    }

    /// IDs acknowledged so far, in ack order.
    pub fn acked(&self) -> Vec<CorrelationId> {
        self.acked.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageSource for ChannelSource {
    async fn recv(&mut self) -> Option<Record> {
        self.rx.recv().await
    }

    async fn ack(&mut self, id: CorrelationId) {
        self.acked.lock().unwrap().push(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn push_recv_ack_roundtrip() {
        let (mut source, handle) = ChannelSource::new(4);
        let record = Record::new(CorrelationId::new(), HashMap::new());
        let id = record.id;

        assert!(handle.push(record).await);
        let received = source.recv().await.unwrap();
        assert_eq!(received.id, id);

        source.ack(id).await;
        assert_eq!(handle.acked(), vec![id]);
    }

    #[tokio::test]
    async fn recv_returns_none_when_producer_is_dropped() {
        let (mut source, handle) = ChannelSource::new(4);
        drop(handle);
        assert!(source.recv().await.is_none());
    }
}
