//! gossip-daemon: Runs a single cluster member on UDP and TCP.
//!
//! Answers probes, relays indirect probes, disseminates membership
//! gossip and serves push/pull state exchanges until Ctrl+C.

use anyhow::Result;
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gossip_core::config::DEFAULT_PORT;
use gossip_core::{NodeStateKind, NoopDelegate, TransportConfig};
use gossip_daemon::Node;

#[derive(Parser, Debug)]
#[command(name = "gossip-daemon")]
#[command(about = "SWIM gossip membership node")]
struct Args {
    /// Address to bind UDP and TCP on
    #[arg(short, long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))]
    bind: SocketAddr,

    /// IP to publish to other members (defaults to the outbound interface
    /// when binding a wildcard address)
    #[arg(long, value_name = "IP")]
    advertise: Option<IpAddr>,

    /// Node name (defaults to the bound address)
    #[arg(short, long)]
    name: Option<String>,

    /// Compress outgoing datagrams and push/pull state
    #[arg(long)]
    compression: bool,

    /// How long a relayed probe waits for an ack
    #[arg(long, default_value_t = 500)]
    probe_timeout_ms: u64,

    /// Peer to run a push/pull sync with at startup (repeatable)
    #[arg(long = "push-pull", value_name = "ADDR")]
    push_pull: Vec<SocketAddr>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,gossip_core=debug,gossip_daemon=debug"
    } else {
        "info,gossip_core=info,gossip_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting gossip-daemon");

    let config = TransportConfig {
        probe_timeout: Duration::from_millis(args.probe_timeout_ms),
        advertise_ip: args.advertise,
        ..TransportConfig::default()
    }
    .with_compression(args.compression);

    let name = args.name.unwrap_or_else(|| args.bind.to_string());
    let node = Node::start(name, args.bind, config, Arc::new(NoopDelegate)).await?;
    info!(
        "Node {} bound to {}, advertised as {}",
        node.name(),
        node.local_addr(),
        node.advertised_addr()
    );

    for peer in &args.push_pull {
        if let Err(e) = node.sync_with(*peer).await {
            error!("Failed to sync with {}: {}", peer, e);
        }
    }

    info!("Daemon running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    let table = node.table();
    info!(
        "Known members: {} alive, {} suspect, {} dead",
        table.count(NodeStateKind::Alive),
        table.count(NodeStateKind::Suspect),
        table.count(NodeStateKind::Dead)
    );

    node.shutdown().await;
    Ok(())
}
