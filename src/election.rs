//! Candidate side (vote collection) and voter side (RequestVote handler)
//! of leader election.

use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::core_types::{RequestVoteArgs, RequestVoteReply, Role};
use crate::error::RaftError;
use crate::server::{RaftNode, quorum};
use crate::validation::validate_request_vote;

impl RaftNode {
    /// Runs one election: bump the term, vote for self, ask every peer in
    /// parallel and tally the answers once they have all settled.
    ///
    /// Losing (or a split vote) leaves the node a Candidate with the
    /// election timer re-armed; the next timeout starts a new term.
    pub async fn start_election(&self) -> Result<(), RaftError> {
        let (term, args, peers) = {
            let mut s = self.lock().await;
            if s.role == Role::Leader {
                return Ok(());
            }
            let term = match self.become_candidate(&mut s) {
                Ok(term) => term,
                Err(e) => {
                    error!(id = s.id, term = s.current_term, error = %e, "could not persist candidacy");
                    self.arm_election_timer(&mut s);
                    return Err(e);
                }
            };
            if s.peers.is_empty() {
                self.become_leader(&mut s);
                return Ok(());
            }
            let args = RequestVoteArgs {
                term,
                candidate_id: s.id,
                last_log_index: s.log.last_index(),
                last_log_term: s.log.last_term(),
            };
            (term, args, s.peers.clone())
        };

        let mut pending = JoinSet::new();
        for peer in peers.iter().copied() {
            let transport = Arc::clone(&self.inner.transport);
            let args = args.clone();
            pending.spawn(async move { (peer, transport.request_vote(peer, args).await) });
        }

        let needed = quorum(peers.len());
        let mut votes = 1;
        while let Some(joined) = pending.join_next().await {
            let (peer, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(id = self.id(), term, error = %e, "vote request task failed");
                    continue;
                }
            };
            match result {
                Ok(reply) if reply.term > term => {
                    pending.abort_all();
                    let mut s = self.lock().await;
                    info!(id = s.id, term, peer, peer_term = reply.term, "newer term seen during election, abandoning");
                    if reply.term > s.current_term {
                        if let Err(e) = self.become_follower(&mut s, reply.term, None) {
                            error!(id = s.id, error = %e, "could not persist newer term");
                            self.arm_election_timer(&mut s);
                            return Err(e);
                        }
                    }
                    return Ok(());
                }
                Ok(reply) if reply.vote_granted && reply.term == term => {
                    votes += 1;
                    debug!(id = self.id(), term, peer, votes, needed, "vote granted");
                }
                Ok(_) => debug!(id = self.id(), term, peer, "vote denied"),
                Err(e) => debug!(id = self.id(), term, peer, error = %e, "no vote from unreachable peer"),
            }
        }

        let mut s = self.lock().await;
        if s.role == Role::Candidate && s.current_term == term && votes >= needed {
            info!(id = s.id, term, votes, needed, "election won");
            self.become_leader(&mut s);
        } else if s.role == Role::Candidate && s.current_term == term {
            info!(id = s.id, term, votes, needed, "election lost, will retry");
            self.arm_election_timer(&mut s);
        }
        Ok(())
    }

    /// Inbound RequestVote.
    ///
    /// Grants at most one vote per term, and only to a candidate whose log
    /// is at least as up to date as ours. The vote is persisted before the
    /// reply leaves.
    pub async fn handle_request_vote(
        &self,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteReply, RaftError> {
        validate_request_vote(&args)?;
        let mut s = self.lock().await;
        if args.term < s.current_term {
            debug!(id = s.id, term = s.current_term, candidate = args.candidate_id, candidate_term = args.term, "vote rejected: stale term");
            return Ok(RequestVoteReply {
                term: s.current_term,
                vote_granted: false,
            });
        }
        if args.term > s.current_term {
            self.become_follower(&mut s, args.term, None)?;
        }

        let free_to_vote = s.voted_for.is_none() || s.voted_for == Some(args.candidate_id);
        let up_to_date = s
            .log
            .candidate_is_up_to_date(args.last_log_term, args.last_log_index);
        if !free_to_vote || !up_to_date {
            debug!(
                id = s.id,
                term = s.current_term,
                candidate = args.candidate_id,
                voted_for = ?s.voted_for,
                up_to_date,
                "vote rejected"
            );
            return Ok(RequestVoteReply {
                term: s.current_term,
                vote_granted: false,
            });
        }

        if s.voted_for.is_none() {
            let term = s.current_term;
            s.set_term_and_vote(term, Some(args.candidate_id))?;
        }
        self.arm_election_timer(&mut s);
        info!(id = s.id, term = s.current_term, candidate = args.candidate_id, "vote granted");
        Ok(RequestVoteReply {
            term: s.current_term,
            vote_granted: true,
        })
    }
}
