//! In-process cluster harness: nodes talk through a shared routing table
//! instead of sockets. Any node can be cut off from the rest (requests fail
//! fast) or hung (requests to it never complete).

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use raft_node::storage::HardState;
use raft_node::{
    AppendEntriesArgs, AppendEntriesReply, LogEntry, MemoryStore, NodeId, RaftConfig, RaftError,
    RaftNode, RequestVoteArgs, RequestVoteReply, Role, Transport,
};

#[derive(Default)]
pub struct Network {
    nodes: RwLock<HashMap<NodeId, RaftNode>>,
    isolated: RwLock<HashSet<NodeId>>,
    hung: RwLock<HashSet<NodeId>>,
}

impl Network {
    fn is_hung(&self, to: NodeId) -> bool {
        self.hung.read().unwrap().contains(&to)
    }

    fn route(&self, from: NodeId, to: NodeId) -> Result<RaftNode, RaftError> {
        let isolated = self.isolated.read().unwrap();
        if isolated.contains(&from) || isolated.contains(&to) {
            return Err(RaftError::Transport {
                peer: to,
                reason: "partitioned".into(),
            });
        }
        self.nodes
            .read()
            .unwrap()
            .get(&to)
            .cloned()
            .ok_or(RaftError::UnknownPeer(to))
    }
}

pub struct MemTransport {
    from: NodeId,
    net: Arc<Network>,
}

fn remote(peer: NodeId, e: RaftError) -> RaftError {
    let retryable = e.is_retryable() || matches!(e, RaftError::Persistence { .. });
    RaftError::Remote {
        peer,
        message: e.to_string(),
        retryable,
    }
}

#[async_trait]
impl Transport for MemTransport {
    async fn request_vote(
        &self,
        peer: NodeId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, RaftError> {
        if self.net.is_hung(peer) {
            std::future::pending::<()>().await;
        }
        let node = self.net.route(self.from, peer)?;
        node.handle_request_vote(args)
            .await
            .map_err(|e| remote(peer, e))
    }

    async fn append_entries(
        &self,
        peer: NodeId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, RaftError> {
        if self.net.is_hung(peer) {
            std::future::pending::<()>().await;
        }
        let node = self.net.route(self.from, peer)?;
        node.handle_append_entries(args)
            .await
            .map_err(|e| remote(peer, e))
    }
}

/// Timers long enough that nothing fires during a test; the test drives
/// elections and replication rounds itself.
pub fn manual_timers() -> RaftConfig {
    RaftConfig {
        election_timeout_min: Duration::from_secs(60),
        election_timeout_max: Duration::from_secs(90),
        heartbeat_interval: Duration::from_secs(30),
    }
}

pub fn fast_timers() -> RaftConfig {
    RaftConfig {
        election_timeout_min: Duration::from_millis(80),
        election_timeout_max: Duration::from_millis(160),
        heartbeat_interval: Duration::from_millis(20),
    }
}

pub fn entries(specs: &[(u64, &str)]) -> Vec<LogEntry> {
    specs
        .iter()
        .enumerate()
        .map(|(i, &(term, command))| LogEntry::new(i as u64 + 1, term, command))
        .collect()
}

pub fn store_with(term: u64, log: Vec<LogEntry>) -> MemoryStore {
    MemoryStore::with_contents(
        HardState {
            current_term: term,
            voted_for: None,
            commit_index: 0,
        },
        log,
    )
}

pub struct Cluster {
    pub net: Arc<Network>,
    ids: Vec<NodeId>,
    config: RaftConfig,
    stores: HashMap<NodeId, MemoryStore>,
    applied: HashMap<NodeId, Arc<Mutex<Vec<LogEntry>>>>,
}

impl Cluster {
    /// Nodes `1..=size`, all starting from empty stores.
    pub fn new(size: u64, config: RaftConfig) -> Cluster {
        Self::with_stores((1..=size).map(|id| (id, MemoryStore::new())).collect(), config)
    }

    pub fn with_stores(stores: Vec<(NodeId, MemoryStore)>, config: RaftConfig) -> Cluster {
        let mut cluster = Cluster {
            net: Arc::new(Network::default()),
            ids: stores.iter().map(|(id, _)| *id).collect(),
            config,
            stores: HashMap::new(),
            applied: HashMap::new(),
        };
        for (id, store) in stores {
            cluster.boot(id, store);
        }
        cluster
    }

    /// (Re)creates node `id` from `store` and puts it on the network.
    pub fn boot(&mut self, id: NodeId, store: MemoryStore) {
        let peers = self.ids.iter().copied().filter(|&p| p != id).collect();
        let applied = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&applied);
        let transport = Arc::new(MemTransport {
            from: id,
            net: Arc::clone(&self.net),
        });
        let node = RaftNode::new(id, peers, self.config, store.clone(), transport, move |e: &LogEntry| {
            sink.lock().unwrap().push(e.clone())
        })
        .expect("node should build");
        self.stores.insert(id, store);
        self.applied.insert(id, applied);
        self.net.nodes.write().unwrap().insert(id, node);
    }

    pub fn ids(&self) -> &[NodeId] {
        &self.ids
    }

    pub fn node(&self, id: NodeId) -> RaftNode {
        self.net.nodes.read().unwrap()[&id].clone()
    }

    pub fn store(&self, id: NodeId) -> MemoryStore {
        self.stores[&id].clone()
    }

    pub fn applied(&self, id: NodeId) -> Vec<LogEntry> {
        self.applied[&id].lock().unwrap().clone()
    }

    pub fn isolate(&self, id: NodeId) {
        self.net.isolated.write().unwrap().insert(id);
    }

    pub fn heal(&self, id: NodeId) {
        self.net.isolated.write().unwrap().remove(&id);
    }

    /// From now on, requests sent to `id` never get an answer.
    pub fn hang(&self, id: NodeId) {
        self.net.hung.write().unwrap().insert(id);
    }

    pub async fn start_all(&self) {
        for &id in &self.ids {
            self.node(id).start().await;
        }
    }

    pub async fn shutdown_all(&self) {
        for &id in &self.ids {
            self.node(id).shutdown().await;
        }
    }

    pub async fn leaders(&self) -> Vec<(NodeId, u64)> {
        let mut leaders = Vec::new();
        for &id in &self.ids {
            let status = self.node(id).status().await;
            if status.role == Role::Leader {
                leaders.push((id, status.term));
            }
        }
        leaders
    }

    /// Polls until some reachable node leads, or `within` elapses.
    pub async fn wait_for_leader(&self, within: Duration) -> Option<NodeId> {
        let deadline = tokio::time::Instant::now() + within;
        while tokio::time::Instant::now() < deadline {
            let isolated = self.net.isolated.read().unwrap().clone();
            let leader = self
                .leaders()
                .await
                .into_iter()
                .map(|(id, _)| id)
                .find(|id| !isolated.contains(id));
            if leader.is_some() {
                return leader;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    /// Elects `id` by hand and lets it announce itself to every follower.
    pub async fn elect(&self, id: NodeId) {
        let node = self.node(id);
        node.start_election().await.expect("election should run");
        assert_eq!(node.role().await, Role::Leader, "node {} should have won", id);
        node.replicate_to_all().await.expect("announce round");
    }
}
