//! Shardplace Scheduler Service
//!
//! Runs the scheduling coordinator against an in-memory cluster loaded
//! from a topology file:
//! - Periodic and administrator-added schedulers
//! - Operator patrol and dispatch
//! - Scheduler list persisted across restarts

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use shardplace_core::{Cluster, MemoryCluster, ScheduleOptions, Topology};
use shardplace_scheduler::{
    ConfigStore, Coordinator, FileConfigStore, MemoryConfigStore, ServiceConfig,
};

#[derive(Parser)]
#[command(name = "shardplace-scheduler")]
#[command(about = "Shardplace placement scheduling service")]
struct Cli {
    /// Topology file (JSON) describing nodes and shards
    #[arg(long)]
    topology: Option<PathBuf>,

    /// Where the active scheduler list is persisted
    #[arg(long, env = "SHARDPLACE_CONFIG_PATH")]
    config_path: Option<PathBuf>,

    /// Interval between operator patrols in milliseconds
    #[arg(long)]
    patrol_interval_ms: Option<u64>,

    /// Minimum seconds between two operators on the same shard
    #[arg(long)]
    throttle_cooldown: Option<u64>,

    /// Scheduler types to start on first run (comma separated)
    #[arg(long, value_delimiter = ',')]
    schedulers: Option<Vec<String>>,

    /// Dry run mode (track operators, never apply steps)
    #[arg(long, default_value = "false")]
    dry_run: bool,
}

impl Cli {
    fn apply(&self, config: &mut ServiceConfig) {
        if let Some(path) = &self.config_path {
            config.config_path = Some(path.clone());
        }
        if let Some(ms) = self.patrol_interval_ms {
            config.patrol_interval_ms = ms;
        }
        if let Some(secs) = self.throttle_cooldown {
            config.throttle_cooldown_secs = secs;
        }
        if let Some(schedulers) = &self.schedulers {
            config.initial_schedulers = schedulers.clone();
        }
        config.dry_run |= self.dry_run;
    }
}

fn load_cluster(path: Option<&PathBuf>, options: ScheduleOptions) -> anyhow::Result<MemoryCluster> {
    let Some(path) = path else {
        return Ok(MemoryCluster::new(options));
    };
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let topology: Topology =
        serde_json::from_slice(&data).with_context(|| format!("parsing {}", path.display()))?;
    Ok(MemoryCluster::from_topology(topology, options)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    let cli = Cli::parse();

    let mut config = ServiceConfig::from_env()?;
    cli.apply(&mut config);
    config.validate()?;
    let options = ScheduleOptions::from_env()?;

    let cluster = Arc::new(load_cluster(cli.topology.as_ref(), options)?);
    let store: Arc<dyn ConfigStore> = match &config.config_path {
        Some(path) => Arc::new(FileConfigStore::new(path.clone())),
        None => Arc::new(MemoryConfigStore::new()),
    };

    info!(
        nodes = cluster.nodes().len(),
        shards = cluster.shard_count(),
        dry_run = config.dry_run,
        config_path = ?config.config_path,
        "Starting shardplace scheduler"
    );

    let coordinator = Arc::new(Coordinator::new(cluster.clone(), cluster, store, config));
    let mut run = tokio::spawn(coordinator.clone().run());

    tokio::select! {
        result = &mut run => {
            match result {
                Ok(Ok(())) => info!("Coordinator exited"),
                Ok(Err(e)) => error!(error = %e, "Coordinator failed"),
                Err(e) => error!(error = %e, "Coordinator task panicked"),
            }
            return Ok(());
        }
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    coordinator.shutdown();
    run.await??;
    info!("Shardplace scheduler stopped");

    Ok(())
}
