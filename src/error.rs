//! Error taxonomy for the node.
//!
//! Protocol rejections (stale term, log mismatch, vote already cast) are not
//! errors: they travel as ordinary replies with `success: false` or
//! `vote_granted: false`. Everything here is a failure of the machinery
//! around the protocol.

use thiserror::Error;

use crate::NodeId;

#[derive(Debug, Error)]
pub enum RaftError {
    /// Connecting to or talking with a peer failed at the I/O level.
    #[error("transport failure talking to node {peer}: {reason}")]
    Transport { peer: NodeId, reason: String },

    #[error("request to node {peer} timed out after {timeout_ms}ms")]
    Timeout { peer: NodeId, timeout_ms: u64 },

    /// The peer answered with an error frame instead of a protocol reply.
    #[error("node {peer} failed the request: {message}")]
    Remote {
        peer: NodeId,
        message: String,
        retryable: bool,
    },

    /// A durable write failed. The transition that needed it did not happen.
    #[error("persistence failure during {operation}: {source}")]
    Persistence {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("unknown peer {0}")]
    UnknownPeer(NodeId),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("peer sent a reply of the wrong kind")]
    UnexpectedReply,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RaftError {
    pub fn persistence(operation: &'static str, source: std::io::Error) -> Self {
        RaftError::Persistence { operation, source }
    }

    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        RaftError::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// Whether the outbound RPC layer should resend the same request.
    ///
    /// Only transport-level failures qualify. A peer that could not persist
    /// is treated like a 5xx and retried; a peer that rejected the payload
    /// as malformed is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            RaftError::Transport { .. } | RaftError::Timeout { .. } | RaftError::Io(_) => true,
            RaftError::Remote { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_failures_are_retryable() {
        assert!(
            RaftError::Transport {
                peer: 2,
                reason: "connection refused".into()
            }
            .is_retryable()
        );
        assert!(
            RaftError::Timeout {
                peer: 2,
                timeout_ms: 5000
            }
            .is_retryable()
        );
        assert!(
            RaftError::Remote {
                peer: 2,
                message: "disk full".into(),
                retryable: true
            }
            .is_retryable()
        );
        assert!(
            !RaftError::Remote {
                peer: 2,
                message: "bad entries".into(),
                retryable: false
            }
            .is_retryable()
        );
        assert!(!RaftError::validation("command", "empty").is_retryable());
        assert!(!RaftError::UnknownPeer(9).is_retryable());
    }
}
