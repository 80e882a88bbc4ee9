//! Messaging channel
//!
//! [`MessageBus`] is the seam to the broker: topic publish and topic
//! subscription. [`LocalBus`] is an in-process broker used by the simulator
//! and tests; it can be taken offline to exercise reconnect paths.

use crate::error::DispatchError;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Topic-based message broker
#[async_trait::async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish an encoded message to every current subscriber of `topic`
    ///
    /// Never waits on consumers.
    async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<(), DispatchError>;

    /// Subscribe to `topic`
    async fn subscribe(&self, topic: &str) -> Result<Subscription, DispatchError>;
}

/// Live subscription to one topic
///
/// The stream ending means the broker connection was lost.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl Subscription {
    /// Wrap a receiving channel
    #[inline]
    #[must_use]
    pub fn new(topic: impl Into<String>, rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            rx,
        }
    }

    /// Subscribed topic
    #[inline]
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next message, or `None` once the connection is gone
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

/// In-process broker
#[derive(Debug)]
pub struct LocalBus {
    topics: DashMap<String, Vec<mpsc::Sender<Vec<u8>>>>,
    online: AtomicBool,
    capacity: usize,
    published: AtomicU64,
}

impl LocalBus {
    /// Default per-subscriber queue depth
    pub const DEFAULT_CAPACITY: usize = 1024;

    /// Create online broker
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Create online broker with a per-subscriber queue depth
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            online: AtomicBool::new(true),
            capacity: capacity.max(1),
            published: AtomicU64::new(0),
        }
    }

    /// Drop every subscription; subscribers see their stream end
    pub fn sever(&self) {
        let dropped: usize = self.topics.iter().map(|entry| entry.value().len()).sum();
        self.topics.clear();
        tracing::info!(dropped, "broker severed all subscriptions");
    }

    /// Take the broker down: sever and refuse new work until [`Self::go_online`]
    pub fn go_offline(&self) {
        self.online.store(false, Ordering::SeqCst);
        self.sever();
    }

    /// Bring the broker back
    pub fn go_online(&self) {
        self.online.store(true, Ordering::SeqCst);
    }

    /// Whether the broker accepts work
    #[inline]
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Live subscribers of `topic`
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map_or(0, |subs| subs.iter().filter(|tx| !tx.is_closed()).count())
    }

    /// Messages accepted so far
    #[inline]
    #[must_use]
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, topic: &str, body: Vec<u8>) -> Result<(), DispatchError> {
        if !self.is_online() {
            return Err(DispatchError::delivery(topic, "broker unreachable"));
        }

        let senders = self
            .topics
            .get(topic)
            .map(|subs| subs.value().clone())
            .unwrap_or_default();
        self.published.fetch_add(1, Ordering::Relaxed);

        if senders.is_empty() {
            tracing::trace!(topic, "no subscribers, message dropped");
            return Ok(());
        }

        let mut full = 0usize;
        let mut closed = 0usize;
        for tx in &senders {
            match tx.try_send(body.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => full += 1,
                Err(TrySendError::Closed(_)) => closed += 1,
            }
        }

        if closed > 0 {
            if let Some(mut subs) = self.topics.get_mut(topic) {
                subs.retain(|tx| !tx.is_closed());
            }
        }

        if full > 0 {
            return Err(DispatchError::delivery(
                topic,
                format!("{full} subscriber queue(s) full"),
            ));
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, DispatchError> {
        if !self.is_online() {
            return Err(DispatchError::ConnectionFailed(format!(
                "broker unreachable for {topic}"
            )));
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        self.topics.entry(topic.to_string()).or_default().push(tx);
        tracing::debug!(topic, "subscribed");
        Ok(Subscription::new(topic, rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fanout_reaches_every_subscriber() {
        let bus = LocalBus::new();
        let mut a = bus.subscribe("t").await.unwrap();
        let mut b = bus.subscribe("t").await.unwrap();

        bus.publish("t", b"hello".to_vec()).await.unwrap();

        assert_eq!(a.next().await.unwrap(), b"hello");
        assert_eq!(b.next().await.unwrap(), b"hello");
        assert_eq!(bus.subscriber_count("t"), 2);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let bus = LocalBus::new();
        bus.publish("nobody", b"x".to_vec()).await.unwrap();
        assert_eq!(bus.published(), 1);
    }

    #[tokio::test]
    async fn offline_broker_refuses_work() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("t").await.unwrap();
        bus.go_offline();

        assert!(sub.next().await.is_none());
        assert!(matches!(
            bus.publish("t", vec![]).await,
            Err(DispatchError::DeliveryFailed { .. })
        ));
        assert!(matches!(
            bus.subscribe("t").await,
            Err(DispatchError::ConnectionFailed(_))
        ));

        bus.go_online();
        assert!(bus.subscribe("t").await.is_ok());
    }

    #[tokio::test]
    async fn full_queue_reports_delivery_failure() {
        let bus = LocalBus::with_capacity(1);
        let _sub = bus.subscribe("t").await.unwrap();

        bus.publish("t", vec![1]).await.unwrap();
        assert!(matches!(
            bus.publish("t", vec![2]).await,
            Err(DispatchError::DeliveryFailed { .. })
        ));
    }

    #[tokio::test]
    async fn dropped_subscription_is_pruned() {
        let bus = LocalBus::new();
        let sub = bus.subscribe("t").await.unwrap();
        drop(sub);

        bus.publish("t", vec![1]).await.unwrap();
        assert_eq!(bus.subscriber_count("t"), 0);
    }
}
