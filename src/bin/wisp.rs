//! WISP daemon binary
//!
//! Binds the discovery server, pings the configured bootstrap peers and
//! logs the peer candidates it hears about.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};
use wisp::{event_channel, Config, DptEvent, DptServer, Endpoint, MemoryPeerTable, Peer};

/// WISP discovery daemon
#[derive(Parser, Debug)]
#[command(name = "wisp", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();

    info!("wisp starting");

    let config = match &args.config {
        Some(path) => match Config::load_file(path) {
            Ok(config) => {
                info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                error!("failed to load configuration: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            info!("no config file given, using defaults");
            Config::new()
        }
    };

    if !config.has_identity() {
        warn!("no identity configured, generating ephemeral keypair");
    }
    let identity = match config.create_identity() {
        Ok(identity) => Arc::new(identity),
        Err(e) => {
            error!("failed to create identity: {}", e);
            std::process::exit(1);
        }
    };
    info!(node_id = %identity.node_id(), "identity ready");

    let table = Arc::new(MemoryPeerTable::new());
    let (event_tx, mut event_rx) = event_channel(256);
    let server = Arc::new(DptServer::new(
        config.discovery.clone(),
        identity,
        table.clone(),
        event_tx,
    ));

    if let Err(e) = server.bind().await {
        error!("failed to bind discovery server: {}", e);
        std::process::exit(1);
    }

    // Probe the bootstrap peers; whoever answers seeds the table
    for peer_addr in &config.peers {
        let addr: SocketAddr = match peer_addr.parse() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "skipping unparseable bootstrap peer");
                continue;
            }
        };
        let endpoint = match addr {
            SocketAddr::V4(v4) => Endpoint::new(*v4.ip(), v4.port(), v4.port()),
            SocketAddr::V6(_) => {
                warn!(peer = %peer_addr, "skipping non-ipv4 bootstrap peer");
                continue;
            }
        };

        let server = server.clone();
        let table = table.clone();
        tokio::spawn(async move {
            match server.ping(&endpoint).await {
                Ok(peer) => {
                    info!(id = %peer.id, endpoint = %peer.endpoint, "bootstrap peer alive");
                    let target = peer.id;
                    table.insert(peer);
                    let _ = server.find_neighbours(&endpoint, &target).await;
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "bootstrap ping failed");
                }
            }
        });
    }

    loop {
        tokio::select! {
            event = event_rx.recv() => match event {
                Some(DptEvent::Listening(addr)) => info!(addr = %addr, "listening"),
                Some(DptEvent::Peers(peers)) => handle_peers(&table, peers),
                Some(DptEvent::Error(error)) => warn!(error = %error, "discovery error"),
                Some(DptEvent::Close) | None => break,
            },
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("failed to listen for shutdown signal: {}", e);
                }
                info!("shutting down");
                let _ = server.destroy().await;
                break;
            }
        }
    }
}

fn handle_peers(table: &MemoryPeerTable, peers: Vec<Peer>) {
    for peer in peers {
        if peer.endpoint.udp_port.is_none() {
            continue;
        }
        info!(id = %peer.id, endpoint = %peer.endpoint, "peer candidate");
        table.insert(peer);
    }
}
