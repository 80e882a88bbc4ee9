//! Server-side synchronization service
//!
//! Ties the transactional store, the delta computer and the dispatcher
//! together:
//! - [`SyncService::mutate`] commits a change and pushes its message live
//! - [`SyncService::resync`] streams a snapshot (or tail) to one host
//! - [`SyncService::serve`] answers resync requests arriving on the server topic

use crate::bus::MessageBus;
use crate::dispatcher::{DispatchContext, Dispatcher};
use crate::error::DispatchError;
use crd_delta::{DeltaComputer, Mutation, TransactionalStore};
use crd_model::{DeltaRecord, ResyncRequest, SyncComplete, SyncMessage, VersionId, SERVER_TOPIC};
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Result of a committed mutation
#[derive(Debug)]
pub struct MutationOutcome {
    /// Journal record of the change
    pub record: DeltaRecord,
    /// Hosts the live message reached
    pub delivered: usize,
    /// Push failures; the commit stands regardless
    pub failures: Vec<DispatchError>,
}

/// Result of streaming state to one host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncReport {
    pub host: String,
    pub messages: usize,
    /// Rows left out because of per-row anomalies
    pub skipped: usize,
    pub high_water: Option<VersionId>,
    /// Whether an incremental tail was sent instead of a full snapshot
    pub incremental: bool,
}

/// Configuration authority: commits changes and feeds relay agents
pub struct SyncService<S> {
    store: Arc<S>,
    computer: DeltaComputer,
    dispatcher: Dispatcher,
    bus: Arc<dyn MessageBus>,
    hosts: DashSet<String>,
    server_topic: String,
    retry_interval: Duration,
}

impl<S> SyncService<S>
where
    S: TransactionalStore + 'static,
{
    /// Default delay before re-subscribing to the server topic
    pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(2);

    /// Create service with default topics and emitters
    #[must_use]
    pub fn new(store: Arc<S>, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            computer: DeltaComputer::from_store(store.clone()),
            dispatcher: Dispatcher::new(bus.clone()),
            store,
            bus,
            hosts: DashSet::new(),
            server_topic: SERVER_TOPIC.to_string(),
            retry_interval: Self::DEFAULT_RETRY_INTERVAL,
        }
    }

    /// With custom dispatcher (topic prefix, consumer topic)
    #[inline]
    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// With custom computer (emitter registry)
    #[inline]
    #[must_use]
    pub fn with_computer(mut self, computer: DeltaComputer) -> Self {
        self.computer = computer;
        self
    }

    /// With server topic
    #[inline]
    #[must_use]
    pub fn with_server_topic(mut self, topic: impl Into<String>) -> Self {
        self.server_topic = topic.into();
        self
    }

    /// With re-subscribe delay
    #[inline]
    #[must_use]
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Underlying store
    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Snapshot computer
    #[inline]
    #[must_use]
    pub fn computer(&self) -> &DeltaComputer {
        &self.computer
    }

    /// Track a host for live pushes
    pub fn register_host(&self, host: impl Into<String>) {
        self.hosts.insert(host.into());
    }

    /// Stop live pushes to a decommissioned host
    ///
    /// Returns whether the host was tracked. A later resync request from the
    /// same host registers it again.
    pub fn deregister_host(&self, host: &str) -> bool {
        let removed = self.hosts.remove(host).is_some();
        if removed {
            tracing::info!(host, "host deregistered");
        }
        removed
    }

    /// Hosts receiving live pushes, sorted
    #[must_use]
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.hosts.iter().map(|h| h.key().clone()).collect();
        hosts.sort();
        hosts
    }

    /// Commit a mutation and push its message to every known host
    ///
    /// # Errors
    /// Returns `DispatchError::Delta` if the commit fails; nothing is pushed then.
    /// Push failures after a successful commit are reported in the outcome.
    pub async fn mutate(&self, mutation: Mutation) -> Result<MutationOutcome, DispatchError> {
        let record = self.store.commit(mutation).await?;
        tracing::debug!(
            kind = %record.resource_kind,
            id = %record.id,
            operation = %record.operation,
            version_id = %record.version_id,
            "mutation committed"
        );

        let mut outcome = MutationOutcome {
            record,
            delivered: 0,
            failures: Vec::new(),
        };

        let message = match self.computer.record_message(&outcome.record).await {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(id = %outcome.record.id, error = %e, "no live message for mutation");
                outcome.failures.push(e.into());
                return Ok(outcome);
            }
        };

        for host in self.hosts() {
            match self
                .dispatcher
                .send_message(&DispatchContext::Host(host), &message)
                .await
            {
                Ok(()) => outcome.delivered += 1,
                Err(e) => outcome.failures.push(e),
            }
        }
        if let Err(e) = self.dispatcher.notify_consumers(&message).await {
            outcome.failures.push(e);
        }

        Ok(outcome)
    }

    /// Stream state to `host`
    ///
    /// Without a watermark the host receives the full ordered snapshot,
    /// otherwise the journal tail after `since`. The stream ends with a
    /// [`SyncComplete`] trailer carrying the journal high-water mark, so the
    /// host's next tail starts after every change the stream reflected.
    ///
    /// # Errors
    /// Returns `DispatchError::Delta` on storage failure and
    /// `DispatchError::BatchInterrupted` if delivery stops part-way
    pub async fn resync(
        &self,
        host: &str,
        since: Option<VersionId>,
    ) -> Result<ResyncReport, DispatchError> {
        self.register_host(host);
        let snapshot = self.computer.catch_up(since).await?;
        let context = DispatchContext::host(host);
        let messages = self
            .dispatcher
            .send_batch(&context, &snapshot.messages)
            .await?;
        if let Some(version_id) = snapshot.high_water {
            self.dispatcher
                .send_message(&context, &SyncComplete { version_id }.into_message())
                .await?;
        }

        let report = ResyncReport {
            host: host.to_string(),
            messages,
            skipped: snapshot.errors.len(),
            high_water: snapshot.high_water,
            incremental: since.is_some(),
        };
        tracing::info!(
            host,
            messages = report.messages,
            skipped = report.skipped,
            incremental = report.incremental,
            "resync sent"
        );
        Ok(report)
    }

    /// Decode and answer one resync request
    ///
    /// # Errors
    /// Returns `DispatchError::Model` for undecodable requests, else as [`Self::resync`]
    pub async fn handle_request(&self, body: &[u8]) -> Result<ResyncReport, DispatchError> {
        let message = SyncMessage::from_slice(body)?;
        let request = ResyncRequest::from_message(&message)?;
        self.resync(&request.host, request.since).await
    }

    /// Answer resync requests until `cancel` fires
    ///
    /// Losing the server subscription is not fatal: the service re-subscribes
    /// after the retry interval.
    pub async fn serve(&self, cancel: CancellationToken) {
        tracing::info!(topic = %self.server_topic, "sync service started");
        while !cancel.is_cancelled() {
            let subscribed = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.bus.subscribe(&self.server_topic) => result,
            };

            match subscribed {
                Ok(mut subscription) => loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        next = subscription.next() => match next {
                            Some(body) => {
                                if let Err(e) = self.handle_request(&body).await {
                                    tracing::warn!(error = %e, "resync request failed");
                                }
                            }
                            None => {
                                tracing::warn!(topic = %self.server_topic, "server subscription lost");
                                break;
                            }
                        },
                    }
                },
                Err(e) => {
                    tracing::warn!(topic = %self.server_topic, error = %e, "server subscribe failed");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                () = tokio::time::sleep(self.retry_interval) => {}
            }
        }
        tracing::info!("sync service stopped");
    }
}
