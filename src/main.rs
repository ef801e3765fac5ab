//! Lattice Agent - per-node kernel container management
//!
//! The agent advertises this node's resources to the manager, launches user
//! compute kernels inside containers, brokers their REPL I/O, and keeps the
//! local container state reconciled.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use lattice_agent::agent::{Agent, LogErrorMonitor};
use lattice_agent::backend::docker::DockerBackend;
use lattice_agent::bus::RedisBus;
use lattice_agent::config::Configuration;
use lattice_agent::resources::{ComputePlugin, CpuPlugin, MemoryPlugin};
use lattice_agent::stats::NullStatCollector;

#[derive(Parser)]
#[command(name = "lattice-agent")]
#[command(about = "Lattice per-node compute session agent")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "agent.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Skip the boot-time image and container scan
    #[arg(long)]
    skip_initial_scan: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("lattice_agent={}", log_level).into()),
        )
        .init();

    info!("Starting Lattice Agent v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(Configuration::load(&cli.config)?);
    let bus = Arc::new(RedisBus::connect(&config.redis.url()).await?);
    let backend = Arc::new(DockerBackend::new(config.clone())?);
    let stat_collector = Arc::new(NullStatCollector::new(config.container.stats_type));

    let plugins: Vec<Arc<dyn ComputePlugin>> =
        vec![Arc::new(CpuPlugin::new()), Arc::new(MemoryPlugin::new())];

    let agent = Agent::new(
        config,
        backend,
        bus,
        plugins,
        stat_collector,
        Arc::new(LogErrorMonitor),
    )
    .await?;
    agent.start(cli.skip_initial_scan).await?;
    info!("Agent {} is up", agent.agent_id());

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let terminate_kernels = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down");
            false
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down and terminating kernels");
            true
        }
    };

    agent.shutdown(terminate_kernels).await;
    info!("Agent stopped");
    Ok(())
}
