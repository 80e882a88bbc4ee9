//! Testing utilities for CRD workspace
//!
//! Shared fixtures, fake appliers and bus helpers.

#![allow(missing_docs)]

use async_trait::async_trait;
use crd_agent::{seed_demo_topology, AgentError, ConfigApplier};
use crd_delta::{MemoryStore, Mutation, TransactionalStore};
use crd_dispatch::Subscription;
use crd_model::{DeltaRecord, ResourceKind, Row, SyncMessage};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Store holding the demo topology (`C1`, `fw`, `CS1`, `BR1`, `M1`, `SR1`, `NM1`, `I1`)
pub async fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    seed_demo_topology(store.as_ref()).await.unwrap();
    store
}

/// Commit a create and return its record
pub async fn create(store: &MemoryStore, kind: ResourceKind, row: Row) -> DeltaRecord {
    store.commit(Mutation::create(kind, row)).await.unwrap()
}

/// Commit a delete and return its record
pub async fn delete(store: &MemoryStore, kind: ResourceKind, id: &str) -> DeltaRecord {
    store.commit(Mutation::delete(kind, id)).await.unwrap()
}

/// Burn `count` versions without leaving rows or records behind
pub async fn skip_versions(store: &MemoryStore, count: usize) {
    store.fail_next_appends(count);
    for n in 0..count {
        let filler = Row::new(format!("__skip_{n}"));
        assert!(store
            .commit(Mutation::create(ResourceKind::Service, filler))
            .await
            .is_err());
    }
}

/// Receive `count` messages, failing the test after `timeout`
pub async fn collect(
    subscription: &mut Subscription,
    count: usize,
    timeout: Duration,
) -> Vec<SyncMessage> {
    let mut messages = Vec::with_capacity(count);
    while messages.len() < count {
        let body = tokio::time::timeout(timeout, subscription.next())
            .await
            .expect("timed out waiting for message")
            .expect("subscription closed");
        messages.push(SyncMessage::from_slice(&body).unwrap());
    }
    messages
}

/// Applier recording every call, with optional failures and latency
#[derive(Debug, Default)]
pub struct RecordingApplier {
    applied: Mutex<Vec<(String, String)>>,
    failing: Mutex<HashSet<String>>,
    delay: Option<Duration>,
}

impl RecordingApplier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every apply
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Reject every apply to `target`
    pub fn fail_target(&self, target: impl Into<String>) {
        self.failing.lock().insert(target.into());
    }

    /// Successful applies, in order
    pub fn applied(&self) -> Vec<(String, String)> {
        self.applied.lock().clone()
    }

    /// Targets applied successfully, in order
    pub fn targets(&self) -> Vec<String> {
        self.applied
            .lock()
            .iter()
            .map(|(target, _)| target.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.applied.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.applied.lock().is_empty()
    }
}

#[async_trait]
impl ConfigApplier for RecordingApplier {
    async fn apply_config(&self, target_id: &str, config: &str) -> Result<(), AgentError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().contains(target_id) {
            return Err(AgentError::apply_failed(target_id, "rejected by target"));
        }
        self.applied
            .lock()
            .push((target_id.to_string(), config.to_string()));
        Ok(())
    }
}
