//! rollcalld — the Rollcall daemon.
//!
//! Binds an ephemeral port, registers it under a service name, keeps the
//! registration alive and prints the healthy members of the service.
//!
//! # Usage
//!
//! ```text
//! rollcalld --service-name mycluster --consul-addr 127.0.0.1:8500
//! rollcalld --config rollcall.toml --watch-mode diff
//! rollcalld --dev
//! ```
//!
//! Console lines go to stdout; logs go to stderr (`RUST_LOG` applies).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rollcall_agent::{Agent, AgentConfig, Console, WatchMode};
use rollcall_catalog::{CoordinationClient, MemoryCatalog};
use rollcall_consul::{ConsulClient, ConsulConfig};

#[derive(Parser)]
#[command(name = "rollcalld", about = "Rollcall service membership agent")]
struct Cli {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Logical service name to join.
    #[arg(long)]
    service_name: Option<String>,

    /// Consul agent HTTP address (host:port).
    #[arg(long)]
    consul_addr: Option<String>,

    /// Consul datacenter for health queries.
    #[arg(long)]
    datacenter: Option<String>,

    /// Address advertised in the registration.
    #[arg(long)]
    advertise_address: Option<String>,

    /// Tag for the registration; repeatable. Replaces configured tags.
    #[arg(long = "tag")]
    tags: Vec<String>,

    /// Membership output: "snapshot" or "diff".
    #[arg(long)]
    watch_mode: Option<WatchMode>,

    /// Use an in-process catalog instead of Consul.
    #[arg(long)]
    dev: bool,

    /// Emit logs as JSON.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = load_config(&cli)?;
    let client = build_client(&cli, &config);

    let backend = if cli.dev { "memory" } else { "consul" };
    info!(service = %config.service_name, backend, "rollcall daemon starting");

    let agent = Agent::start(config, client, Console::stdout())
        .await
        .context("failed to start agent")?;

    if let Err(e) = agent.run_until(shutdown_signal()).await {
        error!(error = %e, "agent stopped with a fatal error");
        return Err(e.into());
    }

    info!("rollcall daemon stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rollcalld=debug,rollcall_agent=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Defaults, then the config file, then command-line overrides.
fn load_config(cli: &Cli) -> anyhow::Result<AgentConfig> {
    let mut config = match &cli.config {
        Some(path) => AgentConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => AgentConfig::default(),
    };

    if let Some(name) = &cli.service_name {
        config.service_name = name.clone();
    }
    if let Some(addr) = &cli.consul_addr {
        config.consul.address = addr.clone();
    }
    if let Some(dc) = &cli.datacenter {
        config.consul.datacenter = Some(dc.clone());
    }
    if let Some(addr) = &cli.advertise_address {
        config.advertise_address = addr.clone();
    }
    if !cli.tags.is_empty() {
        config.tags = cli.tags.clone();
    }
    if let Some(mode) = cli.watch_mode {
        config.watch.mode = mode;
    }

    config.validate()?;
    Ok(config)
}

fn build_client(cli: &Cli, config: &AgentConfig) -> Arc<dyn CoordinationClient> {
    if cli.dev {
        return Arc::new(MemoryCatalog::new());
    }

    Arc::new(ConsulClient::new(ConsulConfig {
        address: config.consul.address.clone(),
        datacenter: config.consul.datacenter.clone(),
        token: config.consul.token.clone(),
        ..ConsulConfig::default()
    }))
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => {
            error!(error = %e, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    }
}
