use anyhow::Context;
use clap::{Parser, Subcommand};
use crd_agent::{run_simulation, seed_demo_topology, RelayConfig, SimulationConfig};
use crd_delta::{DeltaComputer, MemoryStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "crd-relay", version, about = "CRD configuration relay tools")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Seed a demo store and print its ordered snapshot
    Snapshot {
        /// Output as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Run a server, an in-process broker and a fleet of relay agents
    Simulate {
        #[arg(long, default_value_t = 3)]
        agents: usize,
        #[arg(long, default_value_t = 50)]
        mutations: usize,
        /// Sever the broker before every k-th mutation
        #[arg(long)]
        drop_every: Option<usize>,
        /// Random seed for reproducibility
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Output the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the effective relay configuration
    Config {
        /// TOML configuration file
        #[arg(long)]
        file: Option<PathBuf>,
        #[arg(long)]
        hostname: Option<String>,
        #[arg(long)]
        polling_interval: Option<u64>,
        #[arg(long)]
        reconnect_interval: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Snapshot { json } => snapshot(json).await,
        Command::Simulate {
            agents,
            mutations,
            drop_every,
            seed,
            json,
        } => {
            let report = run_simulation(SimulationConfig {
                seed,
                agents,
                mutations,
                drop_every,
                ..SimulationConfig::default()
            })
            .await
            .context("simulation failed")?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Simulation Report");
                println!("=================");
                println!("Seed: {}", report.seed);
                println!("Committed: {}", report.committed);
                println!("Rejected: {}", report.rejected);
                println!("Broker drops: {}", report.severed);
                println!("Snapshot messages: {}", report.snapshot_messages);
                println!();
                for agent in &report.agents {
                    println!(
                        "  {}: applied={} failed={} reconnects={} watermark={} converged={}",
                        agent.host,
                        agent.applied,
                        agent.failed,
                        agent.connection_losses,
                        agent
                            .watermark
                            .map_or_else(|| "-".to_string(), |v| v.to_string()),
                        agent.converged,
                    );
                }
            }
            if !report.converged() {
                anyhow::bail!("fleet did not converge");
            }
            Ok(())
        }
        Command::Config {
            file,
            hostname,
            polling_interval,
            reconnect_interval,
        } => {
            let mut config = RelayConfig::load(file.as_deref())
                .with_context(|| format!("loading configuration from {file:?}"))?;
            if let Some(hostname) = hostname {
                config.hostname = hostname;
            }
            if let Some(secs) = polling_interval {
                config.polling_interval_secs = secs;
            }
            if let Some(secs) = reconnect_interval {
                config.reconnect_interval_secs = secs;
            }
            config.validate()?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn snapshot(json: bool) -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    seed_demo_topology(store.as_ref())
        .await
        .context("seeding demo topology")?;
    let snapshot = DeltaComputer::from_store(store).snapshot().await?;

    for message in &snapshot.messages {
        if json {
            println!("{}", serde_json::to_string(message)?);
        } else {
            let version = message
                .version_id()
                .map_or_else(|| "-".to_string(), |v| v.to_string());
            println!("{version:>6}  {}", message.method);
        }
    }
    for error in &snapshot.errors {
        tracing::warn!(kind = %error.kind, id = %error.id, error = %error.error, "row skipped");
    }
    Ok(())
}

fn init_tracing(verbosity: u8) {
    let mut filter = EnvFilter::from_default_env();

    // Only apply defaults if RUST_LOG is not set
    if std::env::var("RUST_LOG").is_err() {
        let level = match verbosity {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        };
        filter = filter.add_directive(level.into());
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
