use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::NodeId;
use crate::error::RaftError;
use crate::transport::RetryPolicy;

/// A static cluster member: `<id>=<host:port>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSpec {
    pub id: NodeId,
    pub addr: String,
}

impl FromStr for PeerSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, addr) = s
            .split_once('=')
            .ok_or_else(|| format!("expected <id>=<host:port>, got '{}'", s))?;
        let id = id
            .trim()
            .parse::<NodeId>()
            .map_err(|e| format!("bad peer id '{}': {}", id, e))?;
        let addr = addr.trim();
        if addr.is_empty() {
            return Err(format!("peer {} has an empty address", id));
        }
        Ok(PeerSpec {
            id,
            addr: addr.to_string(),
        })
    }
}

/// Command line of the `raft-node` binary.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about = "Run one member of a Raft cluster", long_about = None)]
pub struct NodeConfig {
    /// This node's id; must not appear among the peers
    #[clap(long)]
    pub id: NodeId,

    /// Address to accept peer and client connections on
    #[clap(long, default_value = "127.0.0.1:9081")]
    pub listen: String,

    /// A peer as <id>=<host:port>; repeat for each peer
    #[clap(long = "peer", value_parser)]
    pub peers: Vec<PeerSpec>,

    #[clap(long, default_value_t = 300)]
    pub election_timeout_min_ms: u64,

    #[clap(long, default_value_t = 500)]
    pub election_timeout_max_ms: u64,

    #[clap(long, default_value_t = 150)]
    pub heartbeat_interval_ms: u64,

    /// Per-attempt timeout for outbound RPCs
    #[clap(long, default_value_t = 5000)]
    pub rpc_timeout_ms: u64,

    /// Total attempts per outbound RPC
    #[clap(long, default_value_t = 3)]
    pub rpc_retries: u32,

    /// Delay before the first retry; doubles on each further retry
    #[clap(long, default_value_t = 100)]
    pub rpc_backoff_ms: u64,

    /// Directory holding the node's state and log files
    #[clap(long, default_value = "data")]
    pub data_dir: PathBuf,
}

impl NodeConfig {
    pub fn raft_config(&self) -> RaftConfig {
        RaftConfig {
            election_timeout_min: Duration::from_millis(self.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(self.election_timeout_max_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(self.rpc_timeout_ms),
            attempts: self.rpc_retries.max(1),
            initial_backoff: Duration::from_millis(self.rpc_backoff_ms),
        }
    }

    pub fn peer_addrs(&self) -> HashMap<NodeId, String> {
        self.peers.iter().map(|p| (p.id, p.addr.clone())).collect()
    }

    pub fn validate(&self) -> Result<(), RaftError> {
        self.raft_config().validate()?;
        if self.peers.iter().any(|p| p.id == self.id) {
            return Err(RaftError::Config(format!(
                "node {} is listed as its own peer",
                self.id
            )));
        }
        if self.peer_addrs().len() != self.peers.len() {
            return Err(RaftError::Config("duplicate peer id".into()));
        }
        Ok(())
    }
}

/// Timing knobs of the consensus core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaftConfig {
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(500),
            heartbeat_interval: Duration::from_millis(150),
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> Result<(), RaftError> {
        if self.election_timeout_min.is_zero() {
            return Err(RaftError::Config("election timeout must be positive".into()));
        }
        if self.election_timeout_min > self.election_timeout_max {
            return Err(RaftError::Config(format!(
                "election timeout range is inverted: {:?} > {:?}",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::Config(format!(
                "heartbeat interval {:?} must be shorter than the minimum election timeout {:?}",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> NodeConfig {
        NodeConfig::try_parse_from(std::iter::once("raft-node").chain(args.iter().copied()))
            .expect("arguments should parse")
    }

    #[test]
    fn defaults_match_cluster_timing() {
        let cfg = parse(&["--id", "1"]);
        assert_eq!(cfg.raft_config(), RaftConfig::default());
        let retry = cfg.retry_policy();
        assert_eq!(retry.timeout, Duration::from_secs(5));
        assert_eq!(retry.attempts, 3);
        assert_eq!(retry.initial_backoff, Duration::from_millis(100));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn peers_parse_as_id_and_address() {
        let cfg = parse(&[
            "--id",
            "1",
            "--peer",
            "2=127.0.0.1:9082",
            "--peer",
            "3=127.0.0.1:9083",
        ]);
        let peers = cfg.peer_addrs();
        assert_eq!(peers.get(&2).map(String::as_str), Some("127.0.0.1:9082"));
        assert_eq!(peers.len(), 2);
    }

    #[test]
    fn malformed_peer_is_rejected() {
        assert!("127.0.0.1:9082".parse::<PeerSpec>().is_err());
        assert!("x=127.0.0.1:9082".parse::<PeerSpec>().is_err());
        assert!("2=".parse::<PeerSpec>().is_err());
    }

    #[test]
    fn self_as_peer_is_rejected() {
        let cfg = parse(&["--id", "1", "--peer", "1=127.0.0.1:9081"]);
        assert!(matches!(cfg.validate(), Err(RaftError::Config(_))));
    }

    #[test]
    fn timing_must_be_consistent() {
        let inverted = RaftConfig {
            election_timeout_min: Duration::from_millis(500),
            election_timeout_max: Duration::from_millis(300),
            ..RaftConfig::default()
        };
        assert!(inverted.validate().is_err());

        let slow_heartbeat = RaftConfig {
            heartbeat_interval: Duration::from_millis(300),
            ..RaftConfig::default()
        };
        assert!(slow_heartbeat.validate().is_err());
    }
}
