//! meshtun - full-mesh encrypted UDP tunnel agent
//!
//! One agent per node. Agents find each other through gossip, derive tunnel
//! endpoints deterministically from each peer's private address, and keep
//! one OpenVPN process per live remote peer.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use meshtun_agent::{Config, Manager};

/// meshtun - gossip-driven mesh of encrypted point-to-point tunnels
#[derive(Parser, Debug)]
#[command(name = "meshtun")]
#[command(about = "meshtun - gossip-driven mesh of encrypted point-to-point tunnels")]
#[command(version)]
#[command(long_about = r#"
meshtun keeps a full mesh of encrypted UDP tunnels between the nodes of a
private overlay network. Peers are discovered through gossip; tunnel ports
and in-tunnel addresses are derived deterministically from each peer's
private address, so no negotiation is needed.

EXAMPLES:
  # Run with a config file
  meshtun --config /etc/meshtun/agent.yaml

  # Run configured entirely from the environment
  MESHTUN_NODE_NAME=fra-1 \
  MESHTUN_INTERFACE=eth1 \
  MESHTUN_PUBLIC_IP=203.0.113.5 \
  MESHTUN_GOSSIP_PORT=7946 \
  MESHTUN_COMMON_PREFIX_LEN=8 \
  MESHTUN_REGION_PREFIX_LEN=12 \
  MESHTUN_DC_PREFIX_LEN=16 \
  MESHTUN_START_PORT=1194 \
  MESHTUN_VPN_KEY_FILE=/etc/meshtun/secret.key \
  meshtun

The pre-shared tunnel key must be identical on every node; generate one
with `openvpn --genkey --secret secret.key`.
"#)]
struct Args {
    /// Configuration file (YAML); fields left empty fall back to MESHTUN_*
    /// environment variables
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "MESHTUN_LOG")]
    log_level: String,
}

fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level)?;

    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            // Operator error, not a crash.
            eprintln!("meshtun: {e}");
            std::process::exit(2);
        }
    };

    info!("starting as node {}", config.node_name);
    let manager = Manager::new(config).await?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::mpsc::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, shutting down");
            let _ = shutdown_tx.send(()).await;
        }
    });

    manager.run(shutdown_rx).await?;
    info!("meshtun stopped");
    Ok(())
}
