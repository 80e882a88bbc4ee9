//! Error types for dispatch and the resync service

use crd_delta::DeltaError;
use crd_model::ModelError;

/// Dispatch error
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Publishing on a topic failed
    #[error("delivery to {topic} failed: {reason}")]
    DeliveryFailed { topic: String, reason: String },

    /// A batch stopped part-way
    #[error("batch to {topic} interrupted after {delivered} messages: {reason}")]
    BatchInterrupted {
        topic: String,
        delivered: usize,
        reason: String,
    },

    /// Broker could not be reached for a subscription
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Snapshot or journal failure
    #[error("delta error: {0}")]
    Delta(#[from] DeltaError),

    /// Encoding failure
    #[error("model error: {0}")]
    Model(#[from] ModelError),
}

impl DispatchError {
    /// Whether a caller may retry the same operation later
    ///
    /// The dispatcher never retries on its own.
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::DeliveryFailed { .. }
            | Self::BatchInterrupted { .. }
            | Self::ConnectionFailed(_) => true,
            Self::Delta(e) => e.is_fatal(),
            Self::Model(_) => false,
        }
    }

    /// Create delivery failure
    #[inline]
    pub fn delivery(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DeliveryFailed {
            topic: topic.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_failures_are_retryable() {
        assert!(DispatchError::delivery("crd_relay_agent.h1", "broker down").is_retryable());
        assert!(DispatchError::ConnectionFailed("refused".to_string()).is_retryable());
        assert!(!DispatchError::Model(ModelError::invalid("bad")).is_retryable());
    }

    #[test]
    fn storage_outage_is_retryable_row_anomaly_is_not() {
        assert!(DispatchError::Delta(DeltaError::unavailable("down")).is_retryable());
        assert!(!DispatchError::Delta(DeltaError::InvalidMutation("dup".to_string())).is_retryable());
    }

    #[test]
    fn batch_display() {
        let err = DispatchError::BatchInterrupted {
            topic: "t".to_string(),
            delivered: 3,
            reason: "closed".to_string(),
        };
        assert_eq!(err.to_string(), "batch to t interrupted after 3 messages: closed");
    }
}
