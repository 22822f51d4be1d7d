use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use cv_core::types::MessageKind;

/// One unit of inbound work on its way to the intake.
///
/// Channel adapters and the group router both produce these, so every
/// ingress path reaches the same dedup check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundWork {
    pub channel: String,
    pub chat_id: String,
    pub sender_id: String,
    /// Generated by the intake when absent.
    pub trace_id: Option<String>,
    /// Synthesized from channel and trace id when absent.
    pub idempotency_key: Option<String>,
    pub content: String,
    pub kind: MessageKind,
    pub metadata: BTreeMap<String, String>,
    pub received_at: DateTime<Utc>,
}

impl InboundWork {
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        sender_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            sender_id: sender_id.into(),
            trace_id: None,
            idempotency_key: None,
            content: content.into(),
            kind: MessageKind::Text,
            metadata: BTreeMap::new(),
            received_at: Utc::now(),
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Multi-producer, multi-consumer queue of [`InboundWork`].
///
/// Every handle owns both ends of the channel, so it never disconnects while
/// a producer exists.
#[derive(Clone)]
pub struct WorkQueue {
    tx: flume::Sender<InboundWork>,
    rx: flume::Receiver<InboundWork>,
}

impl WorkQueue {
    pub fn unbounded() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }

    /// Producers wait when `capacity` items are queued.
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = flume::bounded(capacity);
        Self { tx, rx }
    }

    /// Waits for room when the queue is bounded and full.
    pub async fn submit(&self, work: InboundWork) {
        // `self.rx` keeps the channel connected.
        let _ = self.tx.send_async(work).await;
    }

    pub async fn next(&self) -> Option<InboundWork> {
        self.rx.recv_async().await.ok()
    }

    pub fn try_next(&self) -> Option<InboundWork> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
