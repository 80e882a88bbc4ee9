//! In-process sync simulation
//!
//! Wires a [`SyncService`] and a fleet of [`RelayAgent`]s over a
//! [`LocalBus`], drives a seeded stream of random mutations, optionally
//! severs the broker every few mutations, and finally checks that every
//! agent replayed the current ordered snapshot after its last reconnect.

use crate::agent::{AgentState, RelayAgent};
use crate::applier::ConfigApplier;
use crate::config::RelayConfig;
use crate::error::AgentError;
use async_trait::async_trait;
use crd_delta::{DeltaError, MemoryStore, Mutation, TransactionalStore};
use crd_dispatch::{LocalBus, SyncService};
use crd_model::{
    Attrs, ConfigPush, DeltaRecord, Operation, ResourceKind, Row, VersionId, SERVER_TOPIC,
};
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Delay before the service re-subscribes after a severed broker
const SERVICE_RETRY: Duration = Duration::from_millis(100);

/// Simulator configuration
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Relay agents (hosts) to run
    pub agents: usize,
    /// Random mutations to commit
    pub mutations: usize,
    /// Sever the broker before every k-th mutation
    pub drop_every: Option<usize>,
    /// How long to wait for startup and for final convergence
    pub settle_timeout: Duration,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            agents: 3,
            mutations: 50,
            drop_every: None,
            settle_timeout: Duration::from_secs(10),
        }
    }
}

/// Outcome for one agent
#[derive(Debug, Clone, Serialize)]
pub struct AgentOutcome {
    pub host: String,
    pub applied: u64,
    pub failed: u64,
    pub connection_losses: u64,
    pub watermark: Option<VersionId>,
    /// Whether the agent's last applied messages equal the final snapshot
    pub converged: bool,
}

/// Outcome of a simulation run
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub seed: u64,
    pub committed: usize,
    pub rejected: usize,
    pub severed: usize,
    pub snapshot_messages: usize,
    pub high_water: Option<VersionId>,
    pub agents: Vec<AgentOutcome>,
}

impl SimulationReport {
    /// Every agent converged
    #[must_use]
    pub fn converged(&self) -> bool {
        self.agents.iter().all(|agent| agent.converged)
    }
}

/// Applier keeping every applied body in memory
#[derive(Debug, Default)]
pub struct MemoryApplier {
    applied: Mutex<Vec<(String, String)>>,
}

impl MemoryApplier {
    /// Applied `(target, body)` pairs in order
    #[must_use]
    pub fn applied(&self) -> Vec<(String, String)> {
        self.applied.lock().clone()
    }

    /// Whether the last applied entries are exactly `expected`
    #[must_use]
    pub fn ends_with(&self, expected: &[(String, String)]) -> bool {
        self.applied.lock().ends_with(expected)
    }
}

#[async_trait]
impl ConfigApplier for MemoryApplier {
    async fn apply_config(&self, target_id: &str, config: &str) -> Result<(), AgentError> {
        self.applied
            .lock()
            .push((target_id.to_string(), config.to_string()));
        Ok(())
    }
}

/// Commit a small topology touching every resource kind
///
/// Chain `C1` with service `fw` mapped as `M1`, appliance instance `I1`
/// on `M1`, plus chain set `CS1` with its bypass rule, selection rule and
/// network map.
///
/// # Errors
/// Returns the first failing commit
pub async fn seed_demo_topology<S>(store: &S) -> Result<Vec<DeltaRecord>, DeltaError>
where
    S: TransactionalStore + ?Sized,
{
    let rows = [
        (ResourceKind::Chain, Row::new("C1").with_attr("name", "edge")),
        (
            ResourceKind::Service,
            Row::new("fw").with_attr("name", "firewall").with_attr("type", "l3"),
        ),
        (ResourceKind::ChainSet, Row::new("CS1").with_attr("name", "tenant-a")),
        (
            ResourceKind::BypassRule,
            Row::new("BR1")
                .with_attr("chain_id", "C1")
                .with_attr("match", "10.0.0.0/8"),
        ),
        (
            ResourceKind::ChainService,
            Row::new("M1")
                .with_attr("chain_id", "C1")
                .with_attr("service_id", "fw")
                .with_attr("position", 1),
        ),
        (
            ResourceKind::SelectionRule,
            Row::new("SR1")
                .with_attr("chain_set_id", "CS1")
                .with_attr("chain_id", "C1")
                .with_attr("priority", 10),
        ),
        (
            ResourceKind::NetworkMap,
            Row::new("NM1")
                .with_attr("chain_set_id", "CS1")
                .with_attr("network_id", "net-a"),
        ),
        (
            ResourceKind::ApplianceInstance,
            Row::new("I1")
                .with_attr("appliance_map_id", "M1")
                .with_attr("host", "compute-0"),
        ),
    ];

    let mut records = Vec::with_capacity(rows.len());
    for (kind, row) in rows {
        records.push(store.commit(Mutation::create(kind, row)).await?);
    }
    Ok(records)
}

/// Live ids the mutation generator can reference
#[derive(Debug, Default)]
struct Topology {
    chains: Vec<String>,
    services: Vec<String>,
    mappings: Vec<String>,
    instances: Vec<String>,
    serial: usize,
}

impl Topology {
    fn record(&mut self, record: &DeltaRecord) {
        let ids = match record.resource_kind {
            ResourceKind::Chain => &mut self.chains,
            ResourceKind::Service => &mut self.services,
            ResourceKind::ChainService => &mut self.mappings,
            ResourceKind::ApplianceInstance => &mut self.instances,
            _ => return,
        };
        match record.operation {
            Operation::Create => ids.push(record.id.clone()),
            Operation::Delete => ids.retain(|id| *id != record.id),
            Operation::Update => {}
        }
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.serial += 1;
        format!("{prefix}{}", self.serial)
    }

    fn pick(rng: &mut StdRng, ids: &[String]) -> Option<String> {
        if ids.is_empty() {
            None
        } else {
            ids.get(rng.gen_range(0..ids.len())).cloned()
        }
    }

    fn next_mutation(&mut self, rng: &mut StdRng) -> Mutation {
        match rng.gen_range(0..6) {
            1 => {
                let id = self.next_id("svc");
                Mutation::create(ResourceKind::Service, Row::new(id).with_attr("type", "l4"))
            }
            2 => {
                let pair = Self::pick(rng, &self.chains).zip(Self::pick(rng, &self.services));
                match pair {
                    Some((chain, service)) => {
                        let id = self.next_id("M");
                        Mutation::create(
                            ResourceKind::ChainService,
                            Row::new(id)
                                .with_attr("chain_id", chain)
                                .with_attr("service_id", service),
                        )
                    }
                    None => self.new_chain(),
                }
            }
            3 => match Self::pick(rng, &self.mappings) {
                Some(mapping) => {
                    let id = self.next_id("I");
                    Mutation::create(
                        ResourceKind::ApplianceInstance,
                        Row::new(id).with_attr("appliance_map_id", mapping),
                    )
                }
                None => self.new_chain(),
            },
            4 => match Self::pick(rng, &self.chains) {
                Some(chain) => {
                    let mut attrs = Attrs::new();
                    attrs.insert("revision".to_string(), rng.gen_range(0..1000u32).into());
                    Mutation::update(ResourceKind::Chain, chain, attrs)
                }
                None => self.new_chain(),
            },
            5 => match Self::pick(rng, &self.instances) {
                Some(instance) => Mutation::delete(ResourceKind::ApplianceInstance, instance),
                None => self.new_chain(),
            },
            _ => self.new_chain(),
        }
    }

    fn new_chain(&mut self) -> Mutation {
        let id = self.next_id("C");
        Mutation::create(ResourceKind::Chain, Row::new(id))
    }
}

async fn wait_until(timeout: Duration, mut ready: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    loop {
        if ready() {
            return true;
        }
        if started.elapsed() >= timeout {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Run a full simulation
///
/// # Errors
/// Returns an error if seeding or the final snapshot fails, or if the
/// fleet never comes up within the settle timeout
pub async fn run_simulation(config: SimulationConfig) -> Result<SimulationReport, AgentError> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let store = Arc::new(MemoryStore::new());
    let mut topology = Topology::default();
    for record in seed_demo_topology(store.as_ref()).await? {
        topology.record(&record);
    }

    let bus = Arc::new(LocalBus::new());
    let service = Arc::new(
        SyncService::new(store.clone(), bus.clone()).with_retry_interval(SERVICE_RETRY),
    );
    let cancel = CancellationToken::new();
    let mut tasks = Vec::with_capacity(config.agents + 1);
    {
        let service = service.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move { service.serve(cancel).await }));
    }
    if !wait_until(config.settle_timeout, || bus.subscriber_count(SERVER_TOPIC) > 0).await {
        cancel.cancel();
        return Err(AgentError::ConnectionFailed("sync service never subscribed".to_string()));
    }

    let mut fleet = Vec::with_capacity(config.agents);
    for index in 0..config.agents {
        let applier = Arc::new(MemoryApplier::default());
        let agent = Arc::new(RelayAgent::new(
            RelayConfig::new(format!("compute-{index}")).with_reconnect_interval(1),
            bus.clone(),
            applier.clone(),
        ));
        {
            let agent = agent.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move { agent.run(cancel).await }));
        }
        fleet.push((agent, applier));
    }
    if !wait_until(config.settle_timeout, || service.hosts().len() == config.agents).await {
        cancel.cancel();
        return Err(AgentError::ConnectionFailed("agents never registered".to_string()));
    }
    tracing::info!(agents = config.agents, seed = config.seed, "fleet up");

    let mut committed = 0;
    let mut rejected = 0;
    let mut severed = 0;
    for index in 0..config.mutations {
        if let Some(every) = config.drop_every.filter(|every| *every > 0) {
            if index > 0 && index % every == 0 {
                bus.sever();
                severed += 1;
            }
        }
        let mutation = topology.next_mutation(&mut rng);
        match service.mutate(mutation).await {
            Ok(outcome) => {
                committed += 1;
                topology.record(&outcome.record);
            }
            Err(e) => {
                rejected += 1;
                tracing::warn!(error = %e, "mutation rejected");
            }
        }
        tokio::task::yield_now().await;
    }

    // Force one last reconnect so every agent replays the final snapshot.
    let snapshot = service.computer().snapshot().await?;
    let expected: Vec<(String, String)> = snapshot
        .messages
        .iter()
        .filter_map(|message| ConfigPush::from_message(message).ok())
        .map(|push| (push.instance_id, push.config_request))
        .collect();
    bus.sever();
    severed += 1;

    let settled = wait_until(config.settle_timeout, || {
        fleet.iter().all(|(agent, applier)| {
            agent.state() == AgentState::Subscribed && applier.ends_with(&expected)
        })
    })
    .await;
    if !settled {
        tracing::warn!("fleet did not converge within the settle timeout");
    }

    let agents = fleet
        .iter()
        .map(|(agent, applier)| {
            let stats = agent.stats();
            AgentOutcome {
                host: agent.config().hostname.clone(),
                applied: stats.applied,
                failed: stats.failed,
                connection_losses: stats.connection_losses,
                watermark: agent.watermark(),
                converged: applier.ends_with(&expected),
            }
        })
        .collect();

    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "simulation task panicked");
        }
    }

    Ok(SimulationReport {
        seed: config.seed,
        committed,
        rejected,
        severed,
        snapshot_messages: snapshot.len(),
        high_water: snapshot.high_water,
        agents,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crd_delta::DeltaComputer;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn demo_topology_snapshot_is_complete() {
        let store = Arc::new(MemoryStore::new());
        let records = seed_demo_topology(store.as_ref()).await.unwrap();
        assert_eq!(records.len(), ResourceKind::ALL.len());

        let snapshot = DeltaComputer::from_store(store).snapshot().await.unwrap();
        assert!(snapshot.is_complete());
        assert_eq!(snapshot.len(), ResourceKind::ALL.len());
        let instance = snapshot.messages.last().unwrap();
        assert_eq!(instance.method, "create_appliance_instance");
        assert_eq!(instance.field_str("chain_id"), Some("C1"));
    }

    #[test]
    fn generator_is_deterministic_per_seed() {
        let run = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut topology = Topology::default();
            topology.chains.push("C1".to_string());
            (0..20)
                .map(|_| {
                    let m = topology.next_mutation(&mut rng);
                    (m.kind, m.id, m.operation)
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(run(7), run(7));
    }

    #[tokio::test(start_paused = true)]
    async fn fleet_converges_through_broker_drops() {
        let report = run_simulation(SimulationConfig {
            seed: 3,
            agents: 2,
            mutations: 30,
            drop_every: Some(10),
            settle_timeout: Duration::from_secs(30),
        })
        .await
        .unwrap();

        assert_eq!(report.rejected, 0);
        assert_eq!(report.committed, 30);
        assert_eq!(report.severed, 3);
        assert!(report.converged(), "{report:?}");
        assert!(report.agents.iter().all(|a| a.connection_losses >= 1));
    }
}
