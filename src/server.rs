use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::RaftConfig;
use crate::core_types::{ClientReply, ClientRequest, LogEntry, Role, StatusReport};
use crate::error::RaftError;
use crate::log::ReplicatedLog;
use crate::storage::DurableStore;
use crate::transport::Transport;
use crate::validation::validate_client_request;
use crate::{LogIndex, NodeId, Term};

/// The apply hook: receives every committed entry exactly once, in index
/// order.
pub trait StateMachine: Send + 'static {
    fn apply(&mut self, entry: &LogEntry);
}

impl<F> StateMachine for F
where
    F: FnMut(&LogEntry) + Send + 'static,
{
    fn apply(&mut self, entry: &LogEntry) {
        self(entry)
    }
}

/// Majority of a cluster made of `peer_count` peers plus this node.
pub fn quorum(peer_count: usize) -> usize {
    (peer_count + 1) / 2 + 1
}

/// All mutable state of one node. Only reachable through the node's lock,
/// so every transition happens inside a single critical section.
pub struct Server {
    pub(crate) id: NodeId,
    pub(crate) peers: Vec<NodeId>,
    pub(crate) role: Role,
    pub(crate) current_term: Term,
    pub(crate) voted_for: Option<NodeId>,
    pub(crate) leader_id: Option<NodeId>,
    pub(crate) log: ReplicatedLog,
    pub(crate) next_index: HashMap<NodeId, LogIndex>,
    pub(crate) match_index: HashMap<NodeId, LogIndex>,
    pub(crate) store: Box<dyn DurableStore>,
    pub(crate) state_machine: Box<dyn StateMachine>,
    pub(crate) election_timer: Option<JoinHandle<()>>,
    /// Bumped on every arm; a firing alarm with an older epoch is stale.
    pub(crate) election_epoch: u64,
    pub(crate) heartbeat: Option<JoinHandle<()>>,
    /// Latest commit index, for callers waiting on a particular entry.
    pub(crate) commit_watch: watch::Sender<LogIndex>,
}

impl Server {
    /// Writes the new term and vote, then makes them visible. Nothing
    /// changes if the write fails.
    pub(crate) fn set_term_and_vote(
        &mut self,
        term: Term,
        voted_for: Option<NodeId>,
    ) -> Result<(), RaftError> {
        debug_assert!(term >= self.current_term);
        self.store
            .save_state(term, voted_for)
            .map_err(|e| RaftError::persistence("save_state", e))?;
        self.current_term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    /// Persists `entries` as the whole log, then swaps it in.
    pub(crate) fn replace_log(&mut self, entries: Vec<LogEntry>) -> Result<(), RaftError> {
        self.store
            .save_log(&entries)
            .map_err(|e| RaftError::persistence("save_log", e))?;
        self.log.replace(entries);
        Ok(())
    }

    /// Leader-side append of a client command at the end of the log.
    pub(crate) fn append_local(&mut self, command: String) -> Result<LogEntry, RaftError> {
        let entry = self.log.next_entry(self.current_term, command);
        let mut next = self.log.entries().to_vec();
        next.push(entry.clone());
        self.store
            .save_log(&next)
            .map_err(|e| RaftError::persistence("save_log", e))?;
        self.log.push(entry.clone());
        Ok(entry)
    }

    /// Drives `last_applied` up to `commit_index` through the apply hook.
    pub(crate) fn apply_committed(&mut self) -> usize {
        let mut applied = 0;
        while let Some(entry) = self.log.next_to_apply() {
            self.state_machine.apply(&entry);
            applied += 1;
        }
        applied
    }

    /// Publishes and persists a new commit index. Commitment is decided by
    /// quorum replication, so a failed write here is reported and otherwise
    /// ignored.
    pub(crate) fn record_commit_index(&mut self) {
        let commit_index = self.log.commit_index();
        self.commit_watch.send_replace(commit_index);
        if let Err(e) = self.store.save_commit_index(commit_index) {
            error!(id = self.id, term = self.current_term, commit_index, error = %e, "failed to persist commit index");
        }
    }

    pub(crate) fn status(&self) -> StatusReport {
        StatusReport {
            id: self.id,
            role: self.role,
            term: self.current_term,
            voted_for: self.voted_for,
            leader_id: self.leader_id,
            commit_index: self.log.commit_index(),
            last_applied: self.log.last_applied(),
            last_log_index: self.log.last_index(),
            last_log_term: self.log.last_term(),
            peers: self.peers.clone(),
            next_index: self.next_index.iter().map(|(&p, &i)| (p, i)).collect(),
            match_index: self.match_index.iter().map(|(&p, &i)| (p, i)).collect(),
        }
    }
}

pub(crate) struct NodeInner {
    pub(crate) id: NodeId,
    pub(crate) config: RaftConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) server: Mutex<Server>,
}

/// Handle to one Raft node. Clones share the same node.
#[derive(Clone)]
pub struct RaftNode {
    pub(crate) inner: Arc<NodeInner>,
}

impl RaftNode {
    /// Builds a follower from whatever `store` holds (term 0, no vote and an
    /// empty log for a fresh store). Entries up to the persisted commit
    /// index are handed to `state_machine` before this returns.
    ///
    /// Timers are not armed until [`RaftNode::start`].
    pub fn new(
        id: NodeId,
        peers: Vec<NodeId>,
        config: RaftConfig,
        store: impl DurableStore + 'static,
        transport: Arc<dyn Transport>,
        state_machine: impl StateMachine,
    ) -> Result<RaftNode, RaftError> {
        config.validate()?;
        if peers.contains(&id) {
            return Err(RaftError::Config(format!("node {} is listed as its own peer", id)));
        }
        let hard_state = store
            .load_state()
            .map_err(|e| RaftError::persistence("load_state", e))?;
        let entries = store
            .load_log()
            .map_err(|e| RaftError::persistence("load_log", e))?;
        let log = ReplicatedLog::restore(entries, hard_state.commit_index);
        let (commit_watch, _) = watch::channel(log.commit_index());
        let mut server = Server {
            id,
            peers,
            role: Role::Follower,
            current_term: hard_state.current_term,
            voted_for: hard_state.voted_for,
            leader_id: None,
            log,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            store: Box::new(store),
            state_machine: Box::new(state_machine),
            election_timer: None,
            election_epoch: 0,
            heartbeat: None,
            commit_watch,
        };
        let replayed = server.apply_committed();
        info!(
            id,
            term = server.current_term,
            voted_for = ?server.voted_for,
            log_len = server.log.last_index(),
            replayed,
            "node loaded"
        );
        Ok(RaftNode {
            inner: Arc::new(NodeInner {
                id,
                config,
                transport,
                server: Mutex::new(server),
            }),
        })
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, Server> {
        self.inner.server.lock().await
    }

    /// Arms the election timer. Must run inside a tokio runtime.
    pub async fn start(&self) {
        let mut s = self.lock().await;
        self.arm_election_timer(&mut s);
    }

    /// Cancels both timers. In-flight RPC tasks finish on their own.
    pub async fn shutdown(&self) {
        let mut s = self.lock().await;
        self.cancel_election_timer(&mut s);
        self.cancel_heartbeat(&mut s);
    }

    pub async fn status(&self) -> StatusReport {
        self.lock().await.status()
    }

    pub async fn role(&self) -> Role {
        self.lock().await.role
    }

    pub async fn current_term(&self) -> Term {
        self.lock().await.current_term
    }

    pub async fn log_entries(&self) -> Vec<LogEntry> {
        self.lock().await.log.entries().to_vec()
    }

    /// Appends `command` if this node leads, starts a replication round and
    /// reports whether the entry is committed.
    ///
    /// The reply goes out as soon as a quorum holds the entry or the round
    /// ends, whichever is first. A peer that never answers keeps only its
    /// own part of the round waiting.
    pub async fn client_append(&self, request: ClientRequest) -> Result<ClientReply, RaftError> {
        validate_client_request(&request)?;
        let (entry, mut commits) = {
            let mut s = self.lock().await;
            if s.role != Role::Leader {
                return Ok(ClientReply::NotLeader {
                    leader_id: s.leader_id,
                    leader_addr: None,
                });
            }
            let entry = s.append_local(request.command)?;
            (entry, s.commit_watch.subscribe())
        };
        info!(id = self.id(), term = entry.term, index = entry.index, "client entry appended");

        let mut round = tokio::spawn({
            let node = self.clone();
            async move { node.replicate_to_all().await }
        });
        let index = entry.index;
        let quorum_holds_entry = async {
            loop {
                if *commits.borrow_and_update() >= index {
                    return;
                }
                if commits.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        };
        tokio::select! {
            _ = quorum_holds_entry => {}
            finished = &mut round => match finished {
                Ok(result) => result?,
                Err(e) => warn!(id = self.id(), index, error = %e, "replication round task failed"),
            },
        }

        let s = self.lock().await;
        let still_ours = s.log.term_at(entry.index) == Some(entry.term);
        Ok(ClientReply::Appended {
            index: entry.index,
            term: entry.term,
            committed: still_ours && entry.index <= s.log.commit_index(),
        })
    }

    /// Any role -> Follower. A higher `term` is persisted (with the vote
    /// cleared) before anything else changes.
    pub(crate) fn become_follower(
        &self,
        s: &mut Server,
        term: Term,
        leader_id: Option<NodeId>,
    ) -> Result<(), RaftError> {
        let old_role = s.role;
        let old_term = s.current_term;
        if term > s.current_term {
            s.set_term_and_vote(term, None)?;
        }
        self.cancel_heartbeat(s);
        s.role = Role::Follower;
        s.leader_id = leader_id;
        s.next_index.clear();
        s.match_index.clear();
        self.arm_election_timer(s);
        if old_role != Role::Follower || old_term != s.current_term {
            info!(id = s.id, old_role = %old_role, old_term, term = s.current_term, leader = ?leader_id, "became follower");
        }
        Ok(())
    }

    /// Follower/Candidate -> Candidate for the next term, voting for itself.
    pub(crate) fn become_candidate(&self, s: &mut Server) -> Result<Term, RaftError> {
        let term = s.current_term + 1;
        s.set_term_and_vote(term, Some(s.id))?;
        s.role = Role::Candidate;
        s.leader_id = None;
        info!(id = s.id, term, "became candidate");
        Ok(term)
    }

    /// Candidate -> Leader: fresh progress cursors for every peer and the
    /// heartbeat takes over from the election timer.
    pub(crate) fn become_leader(&self, s: &mut Server) {
        s.role = Role::Leader;
        s.leader_id = Some(s.id);
        s.next_index = s.peers.iter().map(|&p| (p, 1)).collect();
        s.match_index = s.peers.iter().map(|&p| (p, 0)).collect();
        self.cancel_election_timer(s);
        self.start_heartbeat(s);
        info!(id = s.id, term = s.current_term, last_log_index = s.log.last_index(), peers = s.peers.len(), "became leader");
    }
}
