//! Inbound side of the TCP protocol: accept loop and per-connection
//! request/reply handling.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::NodeId;
use crate::codec::{read_frame, write_frame};
use crate::core_types::{ClientReply, RpcMessage};
use crate::error::RaftError;
use crate::server::RaftNode;

/// Accepts connections forever, one task per connection. `directory` maps
/// peer ids to client-reachable addresses for not-leader redirects.
pub async fn serve(
    listener: TcpListener,
    node: RaftNode,
    directory: HashMap<NodeId, String>,
) {
    let directory = Arc::new(directory);
    info!(id = node.id(), addr = ?listener.local_addr().ok(), "accepting connections");
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                debug!(id = node.id(), %addr, "new connection");
                let node = node.clone();
                let directory = Arc::clone(&directory);
                tokio::spawn(async move {
                    handle_connection(socket, node, directory).await;
                });
            }
            Err(e) => {
                error!(id = node.id(), error = %e, "failed to accept connection");
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    node: RaftNode,
    directory: Arc<HashMap<NodeId, String>>,
) {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown peer".into());
    loop {
        let request = match read_frame(&mut stream).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!(id = node.id(), peer = %peer_addr, "connection closed by peer");
                return;
            }
            Err(e) => {
                warn!(id = node.id(), peer = %peer_addr, error = %e, "bad frame, dropping connection");
                return;
            }
        };
        let reply = dispatch(&node, &directory, request).await;
        if let Err(e) = write_frame(&mut stream, &reply).await {
            warn!(id = node.id(), peer = %peer_addr, error = %e, "failed to send reply");
            return;
        }
    }
}

/// Routes one request to the node and turns the outcome into a reply frame.
pub async fn dispatch(
    node: &RaftNode,
    directory: &HashMap<NodeId, String>,
    request: RpcMessage,
) -> RpcMessage {
    let kind = request.kind();
    let result = match request {
        RpcMessage::RequestVote(args) => node
            .handle_request_vote(args)
            .await
            .map(RpcMessage::RequestVoteReply),
        RpcMessage::AppendEntries(args) => node
            .handle_append_entries(args)
            .await
            .map(RpcMessage::AppendEntriesReply),
        RpcMessage::ClientAppend(request) => match node.client_append(request).await {
            Ok(ClientReply::NotLeader { leader_id, .. }) => Ok(RpcMessage::ClientReply(ClientReply::NotLeader {
                leader_id,
                leader_addr: leader_id.and_then(|id| directory.get(&id).cloned()),
            })),
            Ok(reply) => Ok(RpcMessage::ClientReply(reply)),
            Err(RaftError::Validation { field, reason }) => Ok(RpcMessage::ClientReply(ClientReply::Rejected {
                reason: format!("invalid {}: {}", field, reason),
            })),
            Err(e) => Err(e),
        },
        RpcMessage::Status => Ok(RpcMessage::StatusReply(node.status().await)),
        RpcMessage::RequestVoteReply(_)
        | RpcMessage::AppendEntriesReply(_)
        | RpcMessage::ClientReply(_)
        | RpcMessage::StatusReply(_)
        | RpcMessage::Error { .. } => Err(RaftError::validation(
            "message",
            format!("{} is a reply, not a request", kind),
        )),
    };
    match result {
        Ok(reply) => reply,
        Err(e) => {
            let retryable = matches!(e, RaftError::Persistence { .. });
            if retryable {
                error!(id = node.id(), kind, error = %e, "request failed");
            } else {
                debug!(id = node.id(), kind, error = %e, "request rejected");
            }
            RpcMessage::Error {
                message: e.to_string(),
                retryable,
            }
        }
    }
}
