//! Fluxgate gateway binary.
//!
//! # Usage
//!
//! ```bash
//! # Start with a gateway config (adapters, schemas, rules, targets, keys)
//! fluxgate-gateway --config gateway.json
//!
//! # Raise verbosity without touching RUST_LOG
//! fluxgate-gateway --config gateway.json --log-level debug
//! ```

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use fluxgate_net::{GatewayConfig, GatewayManager};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Protocol-agnostic data gateway
#[derive(Parser, Debug)]
#[command(name = "fluxgate-gateway")]
#[command(about = "Protocol-agnostic data gateway")]
#[command(version)]
struct Args {
    /// Path to the gateway config file (JSON)
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("fluxgate gateway starting");
    tracing::info!(config = %args.config.display(), "loading configuration");

    let document = std::fs::read_to_string(&args.config)?;
    let config = GatewayConfig::from_json(&document)?;

    let bus = Arc::new(fluxgate_core::EventBus::new());
    let crypto = Arc::new(config.build_crypto()?);
    let manager = Arc::new(GatewayManager::new(bus, crypto));

    config.apply(&manager).await?;
    manager.start().await?;

    let status = manager.status().await;
    tracing::info!(
        adapters = status.adapters.len(),
        rules = status.routing.total_rules,
        "gateway running; press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");

    manager.stop().await;
    Ok(())
}
