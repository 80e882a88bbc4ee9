//! Relay agent
//!
//! One agent runs per host. It keeps a subscription to its relay topic,
//! applies every configuration message it receives, and asks the server
//! for a resync each time the subscription is (re)established.
//!
//! Two loops run side by side:
//! - connection loop: subscribe, request resync, receive; on loss wait
//!   `reconnect_interval` and start over, forever
//! - polling loop: fixed-interval passes of a [`PollTask`]
//!
//! A failed or timed-out apply drops that message only.
//!
//! The watermark is the journal version the host is known to reflect. It is
//! taken from the `sync_complete` trailer closing each resync and from live
//! pushes, never from the create versions inside a snapshot.

use crate::applier::ConfigApplier;
use crate::config::RelayConfig;
use crate::error::AgentError;
use crate::polling::{run_polling_loop, Heartbeat, PollTask};
use crd_dispatch::{MessageBus, Subscription};
use crd_model::{ConfigPush, ResyncRequest, SyncComplete, SyncMessage, VersionId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Connection state of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AgentState {
    #[default]
    Disconnected,
    Connecting,
    Subscribed,
}

/// Running counters
#[derive(Debug, Default)]
pub struct AgentStats {
    received: AtomicU64,
    applied: AtomicU64,
    failed: AtomicU64,
    invalid: AtomicU64,
    connection_losses: AtomicU64,
    connect_failures: AtomicU64,
}

/// Point-in-time copy of [`AgentStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AgentStatsSnapshot {
    pub received: u64,
    pub applied: u64,
    /// Apply errors and timeouts
    pub failed: u64,
    /// Undecodable or untargeted messages
    pub invalid: u64,
    pub connection_losses: u64,
    pub connect_failures: u64,
}

impl AgentStats {
    /// Copy current values
    #[must_use]
    pub fn snapshot(&self) -> AgentStatsSnapshot {
        AgentStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            connection_losses: self.connection_losses.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Why a receive loop ended
enum ReceiveEnd {
    Cancelled,
    ConnectionLost,
}

/// Host-side consumer of configuration messages
pub struct RelayAgent {
    config: RelayConfig,
    bus: Arc<dyn MessageBus>,
    applier: Arc<dyn ConfigApplier>,
    poll_task: Arc<dyn PollTask>,
    state: watch::Sender<AgentState>,
    watermark: watch::Sender<Option<VersionId>>,
    stats: AgentStats,
}

impl RelayAgent {
    /// Create agent with a heartbeat polling task
    #[must_use]
    pub fn new(
        config: RelayConfig,
        bus: Arc<dyn MessageBus>,
        applier: Arc<dyn ConfigApplier>,
    ) -> Self {
        Self {
            config,
            bus,
            applier,
            poll_task: Arc::new(Heartbeat::new()),
            state: watch::channel(AgentState::Disconnected).0,
            watermark: watch::channel(None).0,
            stats: AgentStats::default(),
        }
    }

    /// With custom polling task
    #[inline]
    #[must_use]
    pub fn with_poll_task(mut self, task: Arc<dyn PollTask>) -> Self {
        self.poll_task = task;
        self
    }

    /// Agent configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Current connection state
    #[inline]
    #[must_use]
    pub fn state(&self) -> AgentState {
        *self.state.borrow()
    }

    /// Follow connection state changes
    #[inline]
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    /// Highest journal version this host is known to reflect
    #[inline]
    #[must_use]
    pub fn watermark(&self) -> Option<VersionId> {
        *self.watermark.borrow()
    }

    /// Counters
    #[inline]
    #[must_use]
    pub fn stats(&self) -> AgentStatsSnapshot {
        self.stats.snapshot()
    }

    /// Relay topic of this agent
    #[inline]
    #[must_use]
    pub fn topic(&self) -> String {
        self.config.topic()
    }

    /// Run both loops until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            host = %self.config.hostname,
            topic = %self.topic(),
            "relay agent starting"
        );
        tokio::join!(
            self.connection_loop(&cancel),
            run_polling_loop(
                self.config.polling_interval(),
                self.poll_task.as_ref(),
                &cancel
            ),
        );
        tracing::info!(host = %self.config.hostname, "relay agent stopped");
    }

    async fn connection_loop(&self, cancel: &CancellationToken) {
        let topic = self.topic();
        while !cancel.is_cancelled() {
            self.state.send_replace(AgentState::Connecting);
            let subscribed = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.bus.subscribe(&topic) => result,
            };

            match subscribed {
                Ok(mut subscription) => {
                    self.state.send_replace(AgentState::Subscribed);
                    tracing::info!(%topic, "subscribed");
                    if let Err(e) = self.request_resync().await {
                        tracing::warn!(%topic, error = %e, "resync request failed");
                    }
                    match self.receive(&mut subscription, cancel).await {
                        ReceiveEnd::Cancelled => break,
                        ReceiveEnd::ConnectionLost => {
                            AgentStats::bump(&self.stats.connection_losses);
                            tracing::warn!(
                                %topic,
                                retry_in_secs = self.config.reconnect_interval_secs,
                                "connection lost"
                            );
                        }
                    }
                }
                Err(e) => {
                    AgentStats::bump(&self.stats.connect_failures);
                    tracing::warn!(
                        %topic,
                        error = %e,
                        retry_in_secs = self.config.reconnect_interval_secs,
                        "connect failed"
                    );
                }
            }

            self.state.send_replace(AgentState::Disconnected);
            tokio::select! {
                _ = cancel.cancelled() => break,
                () = tokio::time::sleep(self.config.reconnect_interval()) => {}
            }
        }
        self.state.send_replace(AgentState::Disconnected);
    }

    async fn receive(&self, subscription: &mut Subscription, cancel: &CancellationToken) -> ReceiveEnd {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return ReceiveEnd::Cancelled,
                next = subscription.next() => match next {
                    Some(body) => {
                        if let Err(e) = self.handle_message(&body).await {
                            tracing::warn!(topic = subscription.topic(), error = %e, "message dropped");
                        }
                    }
                    None => return ReceiveEnd::ConnectionLost,
                },
            }
        }
    }

    /// Ask the server to stream state to this host
    ///
    /// The watermark is only reported when incremental catch-up is enabled;
    /// otherwise the server sends a full snapshot.
    ///
    /// # Errors
    /// Returns `AgentError::Dispatch` if the request cannot be published
    pub async fn request_resync(&self) -> Result<(), AgentError> {
        let since = if self.config.incremental_catchup {
            self.watermark()
        } else {
            None
        };
        let request = ResyncRequest {
            host: self.config.hostname.clone(),
            since,
        };
        let body = request.into_message()?.to_bytes()?;
        self.bus
            .publish(&self.config.server_topic, body)
            .await
            .map_err(AgentError::from)?;
        tracing::debug!(server_topic = %self.config.server_topic, ?since, "resync requested");
        Ok(())
    }

    /// Decode and apply one message
    ///
    /// A `sync_complete` trailer only moves the watermark. Any other
    /// versioned message advances it once applied, even if applying fails,
    /// so a redelivered tail does not reapply it.
    ///
    /// # Errors
    /// Returns `AgentError::InvalidMessage` for undecodable or untargeted
    /// messages, and the apply failure otherwise
    pub async fn handle_message(&self, body: &[u8]) -> Result<(), AgentError> {
        AgentStats::bump(&self.stats.received);

        let (message, push) = match decode(body) {
            Ok(Decoded::Trailer(trailer)) => {
                tracing::debug!(version_id = %trailer.version_id, "resync complete");
                self.advance_watermark(trailer.version_id);
                return Ok(());
            }
            Ok(Decoded::Push(message, push)) => (message, push),
            Err(e) => {
                AgentStats::bump(&self.stats.invalid);
                return Err(e.into());
            }
        };

        let timeout = self.config.apply_timeout();
        let result = match tokio::time::timeout(
            timeout,
            self.applier
                .apply_config(&push.instance_id, &push.config_request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AgentError::ApplyTimeout {
                target: push.instance_id.clone(),
                after: timeout,
            }),
        };

        if let Some(version) = message.version_id() {
            self.advance_watermark(version);
        }

        match result {
            Ok(()) => {
                AgentStats::bump(&self.stats.applied);
                tracing::debug!(
                    method = %message.method,
                    target = %push.instance_id,
                    version_id = ?message.version_id(),
                    "config applied"
                );
                Ok(())
            }
            Err(e) => {
                AgentStats::bump(&self.stats.failed);
                Err(e)
            }
        }
    }

    fn advance_watermark(&self, version: VersionId) {
        self.watermark.send_if_modified(|current| {
            if current.map_or(true, |seen| version > seen) {
                *current = Some(version);
                true
            } else {
                false
            }
        });
    }
}

enum Decoded {
    Trailer(SyncComplete),
    Push(SyncMessage, ConfigPush),
}

fn decode(body: &[u8]) -> Result<Decoded, crd_model::ModelError> {
    let message = SyncMessage::from_slice(body)?;
    if let Some(trailer) = SyncComplete::from_message(&message)? {
        return Ok(Decoded::Trailer(trailer));
    }
    let push = ConfigPush::from_message(&message)?;
    Ok(Decoded::Push(message, push))
}

impl std::fmt::Debug for RelayAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayAgent")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("watermark", &self.watermark())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::MockConfigApplier;
    use async_trait::async_trait;
    use crd_dispatch::LocalBus;
    use crd_model::{Operation, ResourceKind, Row};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn instance_message(id: &str, version: u64) -> Vec<u8> {
        SyncMessage::for_row(
            Operation::Create,
            ResourceKind::ApplianceInstance,
            &Row::new(id),
            VersionId(version),
        )
        .to_bytes()
        .unwrap()
    }

    fn agent_with(applier: impl ConfigApplier + 'static) -> (Arc<LocalBus>, RelayAgent) {
        let bus = Arc::new(LocalBus::new());
        let agent = RelayAgent::new(
            RelayConfig::new("compute-1").with_apply_timeout(1),
            bus.clone(),
            Arc::new(applier),
        );
        (bus, agent)
    }

    struct SlowApplier;

    #[async_trait]
    impl ConfigApplier for SlowApplier {
        async fn apply_config(&self, _target_id: &str, _config: &str) -> Result<(), AgentError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn push_is_applied_to_its_instance() {
        let mut applier = MockConfigApplier::new();
        applier
            .expect_apply_config()
            .withf(|target, config| target == "vm-7" && config == "interface eth0")
            .times(1)
            .returning(|_, _| Ok(()));
        let (_bus, agent) = agent_with(applier);

        let body = ConfigPush::new("vm-7", "interface eth0")
            .into_message()
            .to_bytes()
            .unwrap();
        agent.handle_message(&body).await.unwrap();

        assert_eq!(agent.stats().applied, 1);
        assert_eq!(agent.watermark(), None);
    }

    #[tokio::test]
    async fn failed_apply_is_dropped_but_advances_watermark() {
        let mut applier = MockConfigApplier::new();
        applier
            .expect_apply_config()
            .returning(|target, _| Err(AgentError::apply_failed(target, "rejected")));
        let (_bus, agent) = agent_with(applier);

        let err = agent
            .handle_message(&instance_message("I1", 12))
            .await
            .unwrap_err();
        assert!(err.is_apply_failure());
        assert_eq!(agent.watermark(), Some(VersionId(12)));
        assert_eq!(agent.stats().failed, 1);
    }

    #[tokio::test]
    async fn watermark_never_moves_backwards() {
        let mut applier = MockConfigApplier::new();
        applier.expect_apply_config().times(2).returning(|_, _| Ok(()));
        let (_bus, agent) = agent_with(applier);

        agent.handle_message(&instance_message("I2", 20)).await.unwrap();
        agent.handle_message(&instance_message("I1", 11)).await.unwrap();
        assert_eq!(agent.watermark(), Some(VersionId(20)));
    }

    #[tokio::test]
    async fn undecodable_message_never_reaches_applier() {
        let mut applier = MockConfigApplier::new();
        applier.expect_apply_config().never();
        let (_bus, agent) = agent_with(applier);

        let err = agent.handle_message(b"not json").await.unwrap_err();
        assert!(matches!(err, AgentError::InvalidMessage(_)));

        let untargeted = SyncMessage::new("noop", crd_model::Attrs::new())
            .to_bytes()
            .unwrap();
        assert!(agent.handle_message(&untargeted).await.is_err());
        assert_eq!(agent.stats().invalid, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_apply_times_out() {
        let (_bus, agent) = agent_with(SlowApplier);
        let err = agent
            .handle_message(&instance_message("I1", 3))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ApplyTimeout { ref target, .. } if target == "I1"));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_broker_outage() {
        let mut applier = MockConfigApplier::new();
        applier.expect_apply_config().returning(|_, _| Ok(()));
        let (bus, agent) = agent_with(applier);
        let agent = Arc::new(agent);
        let mut state = agent.watch_state();
        let cancel = CancellationToken::new();

        let handle = {
            let agent = agent.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { agent.run(cancel).await })
        };

        state.wait_for(|s| *s == AgentState::Subscribed).await.unwrap();
        bus.go_offline();
        state.wait_for(|s| *s == AgentState::Disconnected).await.unwrap();

        // two reconnect attempts fail while the broker is down
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(agent.stats().connect_failures >= 2);

        bus.go_online();
        state.wait_for(|s| *s == AgentState::Subscribed).await.unwrap();
        assert_eq!(agent.stats().connection_losses, 1);

        bus.publish(&agent.topic(), instance_message("I1", 4))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(agent.stats().applied, 1);

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(agent.state(), AgentState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribe_reports_watermark_when_incremental() {
        let mut applier = MockConfigApplier::new();
        applier.expect_apply_config().returning(|_, _| Ok(()));
        let bus = Arc::new(LocalBus::new());
        let agent = Arc::new(RelayAgent::new(
            RelayConfig::new("compute-2").with_incremental_catchup(true),
            bus.clone(),
            Arc::new(applier),
        ));
        let mut server = bus.subscribe(crd_model::SERVER_TOPIC).await.unwrap();
        let cancel = CancellationToken::new();

        let handle = {
            let agent = agent.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { agent.run(cancel).await })
        };

        let first = SyncMessage::from_slice(&server.next().await.unwrap()).unwrap();
        let first = ResyncRequest::from_message(&first).unwrap();
        assert_eq!(first.host, "compute-2");
        assert_eq!(first.since, None);

        bus.publish(&agent.topic(), instance_message("I1", 9))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        // severing drops the server side too; resubscribe before the agent retries
        bus.sever();
        let mut server = bus.subscribe(crd_model::SERVER_TOPIC).await.unwrap();
        let second = SyncMessage::from_slice(&server.next().await.unwrap()).unwrap();
        let second = ResyncRequest::from_message(&second).unwrap();
        assert_eq!(second.since, Some(VersionId(9)));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn trailer_moves_watermark_without_applying() {
        let mut applier = MockConfigApplier::new();
        applier.expect_apply_config().times(1).returning(|_, _| Ok(()));
        let (_bus, agent) = agent_with(applier);

        agent.handle_message(&instance_message("I1", 1)).await.unwrap();
        let trailer = SyncComplete {
            version_id: VersionId(4),
        }
        .into_message()
        .to_bytes()
        .unwrap();
        agent.handle_message(&trailer).await.unwrap();

        assert_eq!(agent.watermark(), Some(VersionId(4)));
        assert_eq!(agent.stats().applied, 1);
        assert_eq!(agent.stats().received, 2);
    }
}
