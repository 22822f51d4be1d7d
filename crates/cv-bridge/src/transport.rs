use ahash::AHashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::protocol::{encode, GroupEnvelope};

// ---------------------------------------------------------------------------
// Transport errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("transport not connected")]
    NotConnected,

    #[error("timeout after {0}ms")]
    Timeout(u64),
}

pub type Result<T> = std::result::Result<T, TransportError>;

// ---------------------------------------------------------------------------
// RawMessage / Subscription
// ---------------------------------------------------------------------------

/// One record as delivered by the substrate, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub topic: String,
    pub key: Option<String>,
    pub value: Vec<u8>,
}

/// Stream of records for a set of topics.
///
/// Dropping the subscription detaches it from the transport.
pub struct Subscription {
    rx: flume::Receiver<Result<RawMessage>>,
}

impl Subscription {
    pub fn new(rx: flume::Receiver<Result<RawMessage>>) -> Self {
        Self { rx }
    }

    /// Next record. `None` once the transport side has gone away.
    pub async fn next(&self) -> Option<Result<RawMessage>> {
        self.rx.recv_async().await.ok()
    }

    /// Records buffered and ready to read.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

// ---------------------------------------------------------------------------
// GroupTransport trait
// ---------------------------------------------------------------------------

/// An at-least-once publish/subscribe log.
///
/// Delivery is ordered within one topic only. Implementations may redeliver.
#[async_trait]
pub trait GroupTransport: Send + Sync + 'static {
    /// Append `value` to `topic`.
    async fn publish(&self, topic: &str, key: Option<&str>, value: Vec<u8>) -> Result<()>;

    /// Start receiving records from `topics`.
    async fn subscribe(&self, topics: &[String]) -> Result<Subscription>;
}

/// Encode `envelope` and publish it keyed by its sender.
pub async fn publish_envelope(
    transport: &dyn GroupTransport,
    topic: &str,
    envelope: &GroupEnvelope,
) -> Result<()> {
    let bytes = encode(envelope).map_err(|e| TransportError::Serialization(e.to_string()))?;
    transport
        .publish(topic, Some(&envelope.sender_id), bytes)
        .await
}

// ---------------------------------------------------------------------------
// InProcessBroker: for tests and single-process groups
// ---------------------------------------------------------------------------

type Subscribers = AHashMap<String, Vec<flume::Sender<Result<RawMessage>>>>;

/// Fan-out broker backed by flume channels. Every subscriber of a topic gets
/// every record published to it after it subscribed.
///
/// Cloning yields another handle to the same broker, so several agents in
/// one process can share it.
#[derive(Clone, Default)]
pub struct InProcessBroker {
    subscribers: Arc<Mutex<Subscribers>>,
    offline: Arc<AtomicBool>,
    published: Arc<AtomicU64>,
}

impl InProcessBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// While offline, `publish` fails with [`TransportError::NotConnected`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Records accepted by `publish` so far.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    /// Deliver a raw record to current subscribers, bypassing the offline
    /// switch. Used to simulate redelivery.
    pub fn inject(&self, topic: &str, key: Option<&str>, value: Vec<u8>) {
        let msg = RawMessage {
            topic: topic.to_string(),
            key: key.map(str::to_string),
            value,
        };
        let mut subs = self.lock();
        if let Some(senders) = subs.get_mut(topic) {
            senders.retain(|tx| tx.send(Ok(msg.clone())).is_ok());
        }
    }

    /// Push a read failure to every subscriber of `topic`.
    pub fn inject_error(&self, topic: &str, err: impl Fn() -> TransportError) {
        let mut subs = self.lock();
        if let Some(senders) = subs.get_mut(topic) {
            senders.retain(|tx| tx.send(Err(err())).is_ok());
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock().get(topic).map(Vec::len).unwrap_or(0)
    }
}

#[async_trait]
impl GroupTransport for InProcessBroker {
    async fn publish(&self, topic: &str, key: Option<&str>, value: Vec<u8>) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.published.fetch_add(1, Ordering::SeqCst);
        self.inject(topic, key, value);
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> Result<Subscription> {
        let (tx, rx) = flume::unbounded();
        let mut subs = self.lock();
        for topic in topics {
            subs.entry(topic.clone()).or_default().push(tx.clone());
        }
        Ok(Subscription::new(rx))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_sees_every_record() {
        let broker = InProcessBroker::new();
        let a = broker.subscribe(&["t".to_string()]).await.unwrap();
        let b = broker.subscribe(&["t".to_string()]).await.unwrap();

        broker.publish("t", Some("k"), b"hello".to_vec()).await.unwrap();

        for sub in [&a, &b] {
            let msg = sub.next().await.unwrap().unwrap();
            assert_eq!(msg.topic, "t");
            assert_eq!(msg.key.as_deref(), Some("k"));
            assert_eq!(msg.value, b"hello");
        }
    }

    #[tokio::test]
    async fn unsubscribed_topics_are_not_delivered() {
        let broker = InProcessBroker::new();
        let sub = broker.subscribe(&["a".to_string()]).await.unwrap();
        broker.publish("b", None, vec![1]).await.unwrap();
        assert_eq!(sub.pending(), 0);
    }

    #[tokio::test]
    async fn offline_publish_fails() {
        let broker = InProcessBroker::new();
        broker.set_offline(true);
        let err = broker.publish("t", None, vec![]).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
        assert_eq!(broker.published_count(), 0);
    }

    #[tokio::test]
    async fn dropped_subscription_is_pruned() {
        let broker = InProcessBroker::new();
        let sub = broker.subscribe(&["t".to_string()]).await.unwrap();
        assert_eq!(broker.subscriber_count("t"), 1);
        drop(sub);
        broker.publish("t", None, vec![]).await.unwrap();
        assert_eq!(broker.subscriber_count("t"), 0);
    }
}
