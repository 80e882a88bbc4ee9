//! Message dispatch
//!
//! Encodes `{method, payload}` envelopes and publishes them on the topic the
//! routing context resolves to. Fire-and-forget: no acknowledgment, no retry.

use crate::bus::MessageBus;
use crate::error::DispatchError;
use crd_model::{relay_topic, Attrs, SyncMessage, CONSUMER_TOPIC, DEFAULT_TOPIC_PREFIX};
use std::fmt;
use std::sync::Arc;

/// Routing key for a send
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DispatchContext {
    /// Relay agent on one host
    Host(String),
    /// Shared consumer notification fanout
    Consumers,
    /// Explicit topic
    Topic(String),
}

impl DispatchContext {
    /// Relay agent context
    #[inline]
    #[must_use]
    pub fn host(hostname: impl Into<String>) -> Self {
        Self::Host(hostname.into())
    }
}

/// Publishes sync messages to relay agents and consumers
#[derive(Clone)]
pub struct Dispatcher {
    bus: Arc<dyn MessageBus>,
    topic_prefix: String,
    consumer_topic: String,
}

impl Dispatcher {
    /// Create dispatcher with default topic names
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self {
            bus,
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            consumer_topic: CONSUMER_TOPIC.to_string(),
        }
    }

    /// With relay topic prefix
    #[inline]
    #[must_use]
    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = prefix.into();
        self
    }

    /// With consumer fanout topic
    #[inline]
    #[must_use]
    pub fn with_consumer_topic(mut self, topic: impl Into<String>) -> Self {
        self.consumer_topic = topic.into();
        self
    }

    /// Topic a context resolves to
    #[must_use]
    pub fn topic_for(&self, context: &DispatchContext) -> String {
        match context {
            DispatchContext::Host(host) => relay_topic(&self.topic_prefix, host),
            DispatchContext::Consumers => self.consumer_topic.clone(),
            DispatchContext::Topic(topic) => topic.clone(),
        }
    }

    /// Publish `{method, payload}` to `context`
    ///
    /// # Errors
    /// Returns `DispatchError::DeliveryFailed` if the publish fails
    pub async fn send(
        &self,
        context: &DispatchContext,
        method: &str,
        payload: Attrs,
    ) -> Result<(), DispatchError> {
        self.send_message(context, &SyncMessage::new(method, payload))
            .await
    }

    /// Publish a prepared message
    ///
    /// # Errors
    /// Returns `DispatchError::DeliveryFailed` if the publish fails
    pub async fn send_message(
        &self,
        context: &DispatchContext,
        message: &SyncMessage,
    ) -> Result<(), DispatchError> {
        let topic = self.topic_for(context);
        let body = message.to_bytes()?;
        self.bus.publish(&topic, body).await.map_err(|e| {
            tracing::warn!(%topic, method = %message.method, error = %e, "publish failed");
            e
        })?;
        tracing::trace!(%topic, method = %message.method, "published");
        Ok(())
    }

    /// Publish messages in order, stopping at the first failure
    ///
    /// # Returns
    /// Number of messages published
    ///
    /// # Errors
    /// Returns `DispatchError::BatchInterrupted` with the count delivered so far
    pub async fn send_batch(
        &self,
        context: &DispatchContext,
        messages: &[SyncMessage],
    ) -> Result<usize, DispatchError> {
        for (delivered, message) in messages.iter().enumerate() {
            if let Err(e) = self.send_message(context, message).await {
                return Err(DispatchError::BatchInterrupted {
                    topic: self.topic_for(context),
                    delivered,
                    reason: e.to_string(),
                });
            }
        }
        Ok(messages.len())
    }

    /// Publish to the consumer fanout topic
    ///
    /// # Errors
    /// Returns `DispatchError::DeliveryFailed` if the publish fails
    pub async fn notify_consumers(&self, message: &SyncMessage) -> Result<(), DispatchError> {
        self.send_message(&DispatchContext::Consumers, message).await
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("topic_prefix", &self.topic_prefix)
            .field("consumer_topic", &self.consumer_topic)
            .finish_non_exhaustive()
    }
}
