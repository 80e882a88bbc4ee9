//! Target configuration seam
//!
//! The agent never talks to target instances directly; every config body
//! goes through a [`ConfigApplier`].

use crate::error::AgentError;
use async_trait::async_trait;

/// Applies a configuration body to a target instance
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfigApplier: Send + Sync {
    /// Apply `config` to `target_id`
    async fn apply_config(&self, target_id: &str, config: &str) -> Result<(), AgentError>;
}

/// Applier that only records what it would apply
///
/// Used by the binary when no real target driver is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingApplier;

#[async_trait]
impl ConfigApplier for LoggingApplier {
    async fn apply_config(&self, target_id: &str, config: &str) -> Result<(), AgentError> {
        tracing::info!(target_id, bytes = config.len(), "apply_config");
        tracing::trace!(target_id, config, "config body");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn logging_applier_accepts_everything() {
        assert!(LoggingApplier.apply_config("vm-1", "{}").await.is_ok());
    }
}
