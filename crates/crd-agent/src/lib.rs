//! CRD Agent
//!
//! Host side of configuration sync:
//! - [`RelayAgent`]: supervised subscription, apply loop and polling loop
//! - [`ConfigApplier`]: seam to the target instances
//! - [`RelayConfig`]: layered configuration (defaults, TOML, environment)
//! - [`simulator`]: in-process server, broker and agent fleet
//!
//! # Example
//!
//! ```rust,ignore
//! use crd_agent::{LoggingApplier, RelayAgent, RelayConfig};
//!
//! let config = RelayConfig::load(Some(Path::new("/etc/crd/relay.toml")))?;
//! let agent = RelayAgent::new(config, bus, Arc::new(LoggingApplier));
//! agent.run(cancel).await;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod agent;
pub mod applier;
pub mod config;
pub mod error;
pub mod polling;
pub mod simulator;

pub use agent::{AgentState, AgentStats, AgentStatsSnapshot, RelayAgent};
pub use applier::{ConfigApplier, LoggingApplier};
pub use config::{RelayConfig, ENV_PREFIX};
pub use error::AgentError;
pub use polling::{pass_timing, run_polling_loop, Heartbeat, PassTiming, PollTask};
pub use simulator::{
    run_simulation, seed_demo_topology, AgentOutcome, MemoryApplier, SimulationConfig,
    SimulationReport,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
