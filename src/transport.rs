use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::NodeId;
use crate::codec::{read_frame, write_frame};
use crate::core_types::{
    AppendEntriesArgs, AppendEntriesReply, RequestVoteArgs, RequestVoteReply, RpcMessage,
};
use crate::error::RaftError;

/// Outbound delivery of peer RPCs.
///
/// Implementations return `Err` only for failures of delivery; a peer's
/// refusal (`vote_granted: false`, `success: false`) is an `Ok` reply.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn request_vote(
        &self,
        peer: NodeId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, RaftError>;

    async fn append_entries(
        &self,
        peer: NodeId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, RaftError>;
}

/// Timeout and bounded retry for one outbound RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Applies to each attempt separately.
    pub timeout: Duration,
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Wait before the second attempt; doubled before each one after.
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            timeout: Duration::from_secs(5),
            attempts: 3,
            initial_backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Runs `attempt` until it succeeds, fails with a non-retryable error,
    /// or the attempts run out. Each try is bounded by `timeout`.
    pub async fn run<T, F, Fut>(&self, peer: NodeId, mut attempt: F) -> Result<T, RaftError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RaftError>>,
    {
        let attempts = self.attempts.max(1);
        let mut backoff = self.initial_backoff;
        let mut tried = 0;
        loop {
            tried += 1;
            let result = match tokio::time::timeout(self.timeout, attempt()).await {
                Ok(result) => result,
                Err(_) => Err(RaftError::Timeout {
                    peer,
                    timeout_ms: self.timeout.as_millis() as u64,
                }),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && tried < attempts => {
                    debug!(peer, attempt = tried, error = %e, "rpc attempt failed, backing off {:?}", backoff);
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Connects to peers over TCP, one connection per call.
pub struct TcpTransport {
    peers: HashMap<NodeId, String>,
    retry: RetryPolicy,
}

impl TcpTransport {
    pub fn new(peers: HashMap<NodeId, String>, retry: RetryPolicy) -> Self {
        TcpTransport { peers, retry }
    }

    pub fn addr_of(&self, peer: NodeId) -> Option<&str> {
        self.peers.get(&peer).map(String::as_str)
    }

    async fn call(&self, peer: NodeId, request: RpcMessage) -> Result<RpcMessage, RaftError> {
        let addr = self.addr_of(peer).ok_or(RaftError::UnknownPeer(peer))?;
        let message = &request;
        let result = self
            .retry
            .run(peer, || exchange(peer, addr, message))
            .await;
        if let Err(e) = &result {
            warn!(peer, addr, kind = request.kind(), error = %e, "rpc failed");
        }
        result
    }
}

/// One request/response over a fresh connection.
async fn exchange(peer: NodeId, addr: &str, request: &RpcMessage) -> Result<RpcMessage, RaftError> {
    let transport_err = |e: std::io::Error| RaftError::Transport {
        peer,
        reason: e.to_string(),
    };
    let mut stream = TcpStream::connect(addr).await.map_err(transport_err)?;
    match write_frame(&mut stream, request).await {
        Ok(()) => {}
        Err(RaftError::Io(e)) => return Err(transport_err(e)),
        Err(e) => return Err(e),
    }
    let reply = match read_frame(&mut stream).await {
        Ok(Some(reply)) => reply,
        Ok(None) => {
            return Err(RaftError::Transport {
                peer,
                reason: "connection closed before reply".into(),
            });
        }
        Err(RaftError::Io(e)) => return Err(transport_err(e)),
        Err(e) => return Err(e),
    };
    match reply {
        RpcMessage::Error { message, retryable } => Err(RaftError::Remote {
            peer,
            message,
            retryable,
        }),
        reply => Ok(reply),
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn request_vote(
        &self,
        peer: NodeId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, RaftError> {
        match self.call(peer, RpcMessage::RequestVote(args)).await? {
            RpcMessage::RequestVoteReply(reply) => Ok(reply),
            _ => Err(RaftError::UnexpectedReply),
        }
    }

    async fn append_entries(
        &self,
        peer: NodeId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, RaftError> {
        match self.call(peer, RpcMessage::AppendEntries(args)).await? {
            RpcMessage::AppendEntriesReply(reply) => Ok(reply),
            _ => Err(RaftError::UnexpectedReply),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(200),
            attempts,
            initial_backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn retries_transport_failures_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = fast_policy(3)
            .run(2, || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(RaftError::Transport {
                            peer: 2,
                            reason: "refused".into(),
                        })
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_the_last_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), _> = fast_policy(3)
            .run(2, || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(RaftError::Transport {
                        peer: 2,
                        reason: "refused".into(),
                    })
                }
            })
            .await;
        assert!(matches!(result, Err(RaftError::Transport { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), _> = fast_policy(3)
            .run(2, || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(RaftError::validation("entries", "bad"))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hung_attempts_time_out() {
        let policy = RetryPolicy {
            timeout: Duration::from_millis(20),
            attempts: 2,
            initial_backoff: Duration::from_millis(1),
        };
        let result: Result<(), _> = policy
            .run(3, || std::future::pending::<Result<(), RaftError>>())
            .await;
        assert!(matches!(result, Err(RaftError::Timeout { peer: 3, .. })));
    }

    #[tokio::test]
    async fn unknown_peer_is_not_dialled() {
        let transport = TcpTransport::new(HashMap::new(), fast_policy(3));
        let result = transport
            .request_vote(
                9,
                RequestVoteArgs {
                    term: 1,
                    candidate_id: 1,
                    last_log_index: 0,
                    last_log_term: 0,
                },
            )
            .await;
        assert!(matches!(result, Err(RaftError::UnknownPeer(9))));
    }

    #[tokio::test]
    async fn refused_connection_is_a_transport_failure() {
        // Bind then drop to get a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let transport = TcpTransport::new(HashMap::from([(2, addr)]), fast_policy(2));
        let result = transport
            .append_entries(
                2,
                AppendEntriesArgs {
                    term: 1,
                    leader_id: 1,
                    prev_log_index: 0,
                    prev_log_term: 0,
                    entries: vec![],
                    leader_commit: 0,
                },
            )
            .await;
        assert!(matches!(result, Err(RaftError::Transport { peer: 2, .. })));
    }
}
