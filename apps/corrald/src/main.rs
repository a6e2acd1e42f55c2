//! Corral hub daemon.
//!
//! Accepts agent and client WebSocket connections, routes tasks to
//! capable agents, and exposes health/metrics over HTTP.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use corral_hub::{Hub, HubConfig};

/// Corral coordination hub.
#[derive(Parser)]
#[command(name = "corrald")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file (created with defaults if absent).
    #[arg(short, long, env = "CORRAL_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the WebSocket listen address.
    #[arg(long, env = "CORRAL_LISTEN")]
    listen: Option<SocketAddr>,

    /// Override the health/metrics address.
    #[arg(long, env = "CORRAL_OPS")]
    ops: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "CORRAL_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&cli.log_level))
        .context("failed to create log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let mut config =
        HubConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Some(ops) = cli.ops {
        config.ops_addr = ops;
    }

    let hub = Hub::start(config).await.context("failed to start hub")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    hub.shutdown();

    Ok(())
}
