use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use raft_node::{FileStore, LogEntry, NodeConfig, RaftNode, TcpTransport, rpc_server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = NodeConfig::parse();
    config.validate()?;

    let directory = config.peer_addrs();
    let peer_ids: Vec<_> = config.peers.iter().map(|p| p.id).collect();
    let store = FileStore::open(&config.data_dir, config.id)?;
    let transport = Arc::new(TcpTransport::new(directory.clone(), config.retry_policy()));

    // Commands are opaque to the node; a deployment plugs its state machine
    // in here.
    let id = config.id;
    let apply = move |entry: &LogEntry| {
        info!(id, index = entry.index, term = entry.term, command = %entry.command, "applied");
    };

    let node = RaftNode::new(
        config.id,
        peer_ids,
        config.raft_config(),
        store,
        transport,
        apply,
    )?;

    let listener = TcpListener::bind(&config.listen).await?;
    info!(
        id = config.id,
        listen = %config.listen,
        peers = ?config.peers.iter().map(|p| p.id).collect::<Vec<_>>(),
        data_dir = %config.data_dir.display(),
        "raft node starting"
    );
    node.start().await;
    rpc_server::serve(listener, node, directory).await;
    Ok(())
}
