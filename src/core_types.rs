use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::{LogIndex, NodeId, Term};

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Follower => "follower",
            Role::Candidate => "candidate",
            Role::Leader => "leader",
        };
        f.write_str(name)
    }
}

/// One slot of the replicated log. `index` is 1-based and never reassigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub command: String,
}

impl LogEntry {
    pub fn new(index: LogIndex, term: Term, command: impl Into<String>) -> Self {
        LogEntry {
            index,
            term,
            command: command.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: Term,
    pub success: bool,
    /// Set on a consistency-check failure: where the leader should resend from.
    pub conflict_index: Option<LogIndex>,
    /// Set on success: the follower's last log index after reconciling.
    pub last_index: Option<LogIndex>,
}

impl AppendEntriesReply {
    pub fn rejected(term: Term) -> Self {
        AppendEntriesReply {
            term,
            success: false,
            conflict_index: None,
            last_index: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientReply {
    Appended {
        index: LogIndex,
        term: Term,
        committed: bool,
    },
    NotLeader {
        leader_id: Option<NodeId>,
        leader_addr: Option<String>,
    },
    Rejected {
        reason: String,
    },
}

/// Point-in-time view of a node, served to `raft-cli status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub id: NodeId,
    pub role: Role,
    pub term: Term,
    pub voted_for: Option<NodeId>,
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
    pub peers: Vec<NodeId>,
    pub next_index: BTreeMap<NodeId, LogIndex>,
    pub match_index: BTreeMap<NodeId, LogIndex>,
}

/// Everything that crosses a TCP connection, peer-to-peer or client-to-node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcMessage {
    RequestVote(RequestVoteArgs),
    RequestVoteReply(RequestVoteReply),
    AppendEntries(AppendEntriesArgs),
    AppendEntriesReply(AppendEntriesReply),
    ClientAppend(ClientRequest),
    ClientReply(ClientReply),
    Status,
    StatusReply(StatusReport),
    /// The receiver could not produce a protocol reply.
    Error { message: String, retryable: bool },
}

impl RpcMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            RpcMessage::RequestVote(_) => "request_vote",
            RpcMessage::RequestVoteReply(_) => "request_vote_reply",
            RpcMessage::AppendEntries(_) => "append_entries",
            RpcMessage::AppendEntriesReply(_) => "append_entries_reply",
            RpcMessage::ClientAppend(_) => "client_append",
            RpcMessage::ClientReply(_) => "client_reply",
            RpcMessage::Status => "status",
            RpcMessage::StatusReply(_) => "status_reply",
            RpcMessage::Error { .. } => "error",
        }
    }
}
