//! Karst server binary.

use clap::Parser;
use karst::config::{ElectionMode, KarstConfig, PeerConfig};
use karst::node::Node;
use std::path::PathBuf;
use tracing::{debug, error, info};

#[derive(Parser)]
#[command(name = "karst-server")]
#[command(about = "Karst replicated database node")]
struct Args {
    /// Replica ID
    #[arg(short, long, env = "KARST_REPLICA_ID", default_value = "1")]
    replica_id: u64,

    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Journal directory
    #[arg(long, default_value = "/var/lib/karst/wal")]
    wal_dir: PathBuf,

    /// Election mode (off, voter, manual, candidate)
    #[arg(long)]
    election_mode: Option<ElectionMode>,

    /// Peers (format: id=addr,id=addr)
    #[arg(long)]
    peers: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load or create configuration
    let mut config = if let Some(config_path) = args.config {
        KarstConfig::from_file(&config_path)?
    } else {
        KarstConfig::development()
    };

    // Override with CLI args
    config.node.id = args.replica_id;
    config.storage.wal_dir = args.wal_dir;
    if let Some(mode) = args.election_mode {
        config.election.mode = mode;
    }
    if let Some(peers_str) = args.peers {
        config.replication.peers = parse_peers(&peers_str)?;
    }

    karst::observability::init(&config.observability)?;

    if config.observability.metrics_enabled {
        let obs_config = config.observability.clone();
        tokio::spawn(async move {
            if let Err(e) = karst::observability::run_metrics_server(obs_config).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let node = Node::start(config).await?;

    // Drain peer relays until a real transport is wired in.
    for peer in node.config().replication.peers.clone() {
        if let Some(mut rx) = node.relay_stream(peer.id) {
            tokio::spawn(async move {
                while let Some(msg) = rx.recv().await {
                    debug!(peer = peer.id, ?msg, "outbound raft message");
                }
            });
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    node.shutdown();

    Ok(())
}

fn parse_peers(s: &str) -> anyhow::Result<Vec<PeerConfig>> {
    s.split(',')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (id, addr) = part
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("expected id=addr, got {:?}", part))?;
            Ok(PeerConfig {
                id: id.trim().parse()?,
                addr: addr.trim().to_string(),
            })
        })
        .collect()
}
