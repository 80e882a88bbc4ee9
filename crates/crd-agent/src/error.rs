//! Error types for the relay agent
//!
//! Agent-side failures are operator-visible through logs only; none of them
//! terminates the agent. Configuration errors are the exception and stop
//! start-up.

use crd_delta::DeltaError;
use crd_dispatch::DispatchError;
use crd_model::ModelError;
use std::time::Duration;

/// Relay agent error
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Broker connection could not be established or was lost
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Target rejected or failed to apply a configuration
    #[error("apply_config on {target} failed: {reason}")]
    ApplyConfigFailed { target: String, reason: String },

    /// `apply_config` did not finish in time
    #[error("apply_config on {target} timed out after {after:?}")]
    ApplyTimeout { target: String, after: Duration },

    /// Message could not be decoded or has no target
    #[error("invalid message: {0}")]
    InvalidMessage(#[from] ModelError),

    /// Publish to the broker failed
    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Local store failed (simulator and snapshot commands)
    #[error("delta error: {0}")]
    Delta(#[from] DeltaError),

    /// Configuration invalid
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration file unreadable
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file malformed
    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl AgentError {
    /// Whether the error concerns applying one message (dropped, loop continues)
    #[inline]
    #[must_use]
    pub fn is_apply_failure(&self) -> bool {
        matches!(
            self,
            Self::ApplyConfigFailed { .. } | Self::ApplyTimeout { .. }
        )
    }

    /// Create apply failure
    #[inline]
    pub fn apply_failed(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ApplyConfigFailed {
            target: target.into(),
            reason: reason.into(),
        }
    }
}
