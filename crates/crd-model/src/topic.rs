//! Messaging topic naming

/// Default prefix of per-host relay agent topics
pub const DEFAULT_TOPIC_PREFIX: &str = "crd_relay_agent";

/// Shared fanout topic for dashboard/consumer notifications
pub const CONSUMER_TOPIC: &str = "crd_consumer";

/// Topic the configuration service listens on for resync requests
pub const SERVER_TOPIC: &str = "crd_server";

/// Topic of the relay agent running on `hostname`
#[inline]
#[must_use]
pub fn relay_topic(prefix: &str, hostname: &str) -> String {
    format!("{prefix}.{hostname}")
}
