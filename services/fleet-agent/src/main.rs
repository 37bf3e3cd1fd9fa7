//! dockfleet Fleet Agent
//!
//! Runs one infrastructure against a static pool of docker hosts: hosts are
//! brought up on demand, scanned periodically, and torn down on shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dockfleet_agent::config::Config;
use dockfleet_agent::{Infrastructure, LocationRegistry, LocationSpec, MachineProvisioner, StaticPool};

/// dockfleet fleet agent - place containers across a pool of docker hosts.
#[derive(Debug, Parser)]
#[command(name = "fleet-agent")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Infrastructure description (TOML).
    #[arg(long, global = true, env = "FLEET_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the infrastructure and run until interrupted.
    Run,

    /// Load and validate the configuration, then print the strategy chain.
    CheckConfig,

    /// Parse a location string and print what it names.
    Resolve {
        /// e.g. docker:<infraId>:<hostId>:(name=web)
        spec: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(path) = cli.config.clone() {
        config.config_path = Some(path);
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    match cli.command {
        Commands::Run => run(&config).await,
        Commands::CheckConfig => check_config(&config),
        Commands::Resolve { spec } => resolve(&spec),
    }
}

async fn run(config: &Config) -> Result<()> {
    info!("Starting dockfleet fleet agent");

    let infra_config = config
        .load_infrastructure()
        .context("failed to load infrastructure configuration")?;
    info!(
        name = %infra_config.name,
        pool_hosts = infra_config.pool.hosts.len(),
        min_hosts = infra_config.min_hosts,
        "Configuration loaded"
    );

    let provisioner: Arc<dyn MachineProvisioner> = Arc::new(StaticPool::from_config(&infra_config.pool));
    let infrastructure = Arc::new(Infrastructure::new(&infra_config, Some(provisioner))?);

    let registry = LocationRegistry::new();
    registry.register(Arc::clone(&infrastructure)).await;

    if let Err(e) = infrastructure.start().await {
        error!(error = %e, "Infrastructure failed to start");
        infrastructure.shutdown().await?;
        return Err(e.into());
    }
    info!(location = %format!("docker:{}", infrastructure.id()), "Infrastructure ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    registry.unregister(infrastructure.id()).await;
    infrastructure.shutdown().await?;

    info!("Fleet agent shutdown complete");
    Ok(())
}

fn check_config(config: &Config) -> Result<()> {
    let infra_config = config.load_infrastructure()?;
    let infrastructure = Infrastructure::new(&infra_config, None)?;

    println!("infrastructure: {}", infrastructure.name());
    println!("strategies: {}", infrastructure.strategy_ids().join(" -> "));
    println!("pool hosts: {}", infra_config.pool.hosts.len());
    Ok(())
}

fn resolve(raw: &str) -> Result<()> {
    let spec = LocationSpec::parse(raw)?;
    println!("infrastructure: {}", spec.infrastructure);
    if let Some(host) = &spec.host {
        println!("host: {host}");
    }
    println!("name: {}", spec.name);
    println!("display name: {}", spec.display_name);
    Ok(())
}
