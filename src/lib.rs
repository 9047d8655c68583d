//! Single-node Raft consensus: leader election, log replication and
//! commit/apply sequencing over a static set of peers.
//!
//! A [`RaftNode`] owns all of a member's state behind one lock. Timers and
//! per-peer RPC tasks call back into it, so several nodes can live in the
//! same process (which is how the cluster tests run).

pub mod codec;
pub mod config;
pub mod core_types;
pub mod election;
pub mod error;
pub mod log;
pub mod replication;
pub mod rpc_server;
pub mod server;
pub mod storage;
pub mod timer;
pub mod transport;
pub mod validation;

pub type NodeId = u64;
pub type Term = u64;
pub type LogIndex = u64;

pub use config::{NodeConfig, RaftConfig};
pub use core_types::{
    AppendEntriesArgs, AppendEntriesReply, ClientReply, ClientRequest, LogEntry, RequestVoteArgs,
    RequestVoteReply, Role, RpcMessage, StatusReport,
};
pub use error::RaftError;
pub use server::{RaftNode, StateMachine};
pub use storage::{DurableStore, FileStore, MemoryStore};
pub use transport::{RetryPolicy, TcpTransport, Transport};
