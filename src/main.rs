use std::net::SocketAddr;

use anyhow::Result;
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use meshgate::{ClientDelivery, Keypair, Node, NodeConfig, PeerEndpoint};

/// Client id the binary registers for `--topic` subscriptions.
const CONSOLE_CLIENT: &str = "console";

#[derive(Parser, Debug)]
#[command(name = "meshgate")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Static peer to keep connected (HOST:PORT); repeatable.
    #[arg(short, long = "peer", value_name = "PEER")]
    peers: Vec<PeerEndpoint>,

    /// Topic for the console client to subscribe to; repeatable.
    #[arg(short, long = "topic", value_name = "TOPIC")]
    topics: Vec<String>,

    #[arg(long, default_value = "5000")]
    heartbeat_ms: u64,

    #[arg(long, default_value = "2000")]
    sync_ms: u64,

    /// Seconds between peer status reports.
    #[arg(short, long, default_value = "30")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = NodeConfig {
        static_peers: args.peers.clone(),
        ..NodeConfig::default()
    };
    config.registry.heartbeat_interval = Duration::from_millis(args.heartbeat_ms.max(1));
    config.amop.topic_sync_period = Duration::from_millis(args.sync_ms.max(1));

    let node = Node::bind_with_config(&args.bind.to_string(), Keypair::generate(), config).await?;
    info!("Node identity: {}", node.node_id());
    info!("Listening on {}", node.local_endpoint());

    if !args.topics.is_empty() {
        let mut deliveries = node.register_client(CONSOLE_CLIENT, "stdout");
        if let Err(e) = node.subscribe_topics(CONSOLE_CLIENT, &args.topics) {
            warn!(error = %e, "Topic subscription failed");
        }
        tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                match delivery {
                    ClientDelivery::Request { from, topic, data, reply } => {
                        info!(%topic, from = %hex::encode(&from.as_bytes()[..8]), bytes = data.len(), "topic request");
                        let _ = reply.send(b"ack".to_vec());
                    }
                    ClientDelivery::Broadcast { from, topic, data } => {
                        info!(%topic, from = %hex::encode(&from.as_bytes()[..8]), bytes = data.len(), "topic broadcast");
                    }
                }
            }
        });
    }

    let mut interval = time::interval(Duration::from_secs(args.status_interval.max(1)));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let peers = node.peers();
                info!(
                    peers = peers.len(),
                    topic_seq = node.topic_seq(),
                    status_seq = node.status_seq(),
                    "status"
                );
                for peer in peers {
                    info!(
                        peer = %hex::encode(&peer.node_id.as_bytes()[..8]),
                        endpoint = %peer.endpoint,
                        direction = ?peer.direction,
                        status_seq = peer.status_seq,
                        heartbeat_age_ms = peer.heartbeat_age.map(|age| age.as_millis() as u64),
                        topics = ?node.topics_by_node(&peer.node_id),
                        "peer"
                    );
                }
            }
        }
    }

    node.shutdown().await;
    Ok(())
}
