//! Election timer and heartbeat scheduler.
//!
//! Both are tokio tasks whose `JoinHandle` lives in [`Server`], so arming
//! and cancelling happen under the node lock and there is never more than
//! one pending alarm of each kind. The tasks hold a weak reference to the
//! node; dropping every handle to a node lets its timers lapse.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::config::RaftConfig;
use crate::core_types::Role;
use crate::server::{NodeInner, RaftNode, Server};

/// Uniform draw from the configured election timeout range.
pub fn random_election_timeout(config: &RaftConfig) -> Duration {
    let min = config.election_timeout_min.as_millis() as u64;
    let max = config.election_timeout_max.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(min..=max.max(min)))
}

impl RaftNode {
    fn from_inner(inner: Arc<NodeInner>) -> RaftNode {
        RaftNode { inner }
    }

    /// Cancels any pending election alarm and schedules a fresh one.
    pub(crate) fn arm_election_timer(&self, s: &mut Server) {
        self.cancel_election_timer(s);
        s.election_epoch += 1;
        let epoch = s.election_epoch;
        let timeout = random_election_timeout(&self.inner.config);
        let node = Arc::downgrade(&self.inner);
        debug!(id = s.id, term = s.current_term, ?timeout, "election timer armed");
        s.election_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = node.upgrade() {
                RaftNode::from_inner(inner).on_election_timeout(epoch).await;
            }
        }));
    }

    pub(crate) fn cancel_election_timer(&self, s: &mut Server) {
        if let Some(alarm) = s.election_timer.take() {
            alarm.abort();
        }
    }

    async fn on_election_timeout(&self, epoch: u64) {
        {
            let mut s = self.lock().await;
            if s.election_epoch != epoch {
                return;
            }
            // Detach rather than abort: this task is the alarm and goes on
            // to run the election.
            s.election_timer = None;
            if s.role == Role::Leader {
                return;
            }
            debug!(id = s.id, term = s.current_term, role = %s.role, "election timeout");
        }
        if let Err(e) = self.start_election().await {
            warn!(id = self.id(), error = %e, "election could not start");
        }
    }

    /// Starts the leader's periodic replication. The first tick fires
    /// immediately so followers learn of the new leader without delay.
    pub(crate) fn start_heartbeat(&self, s: &mut Server) {
        self.cancel_heartbeat(s);
        let interval = self.inner.config.heartbeat_interval;
        let term = s.current_term;
        let node = Arc::downgrade(&self.inner);
        s.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = node.upgrade() else { break };
                let leader = RaftNode::from_inner(inner);
                // Each round runs on its own so a slow peer cannot hold up
                // the next tick.
                tokio::spawn(async move {
                    if let Err(e) = leader.replicate_to_all().await {
                        warn!(id = leader.id(), term, error = %e, "replication round failed");
                    }
                });
            }
        }));
    }

    pub(crate) fn cancel_heartbeat(&self, s: &mut Server) {
        if let Some(ticker) = s.heartbeat.take() {
            ticker.abort();
        }
    }
}
