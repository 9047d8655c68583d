//! Leader-side log shipping and commit advancement, plus the follower-side
//! AppendEntries handler.

use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::core_types::{AppendEntriesArgs, AppendEntriesReply, Role};
use crate::error::RaftError;
use crate::server::{RaftNode, Server, quorum};
use crate::validation::{MAX_ENTRIES_PER_REQUEST, validate_append_entries};
use crate::{LogIndex, NodeId};

impl Server {
    /// The AppendEntries a leader sends `peer` this round: everything from
    /// `next_index[peer]` (capped per request), anchored on the entry just
    /// before it.
    pub(crate) fn append_request_for(&self, peer: NodeId) -> AppendEntriesArgs {
        let next = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(self.log.last_index() + 1)
            .clamp(1, self.log.last_index() + 1);
        let prev_log_index = next - 1;
        AppendEntriesArgs {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term: self.log.term_at(prev_log_index).unwrap_or(0),
            entries: self.log.entries_from(next, MAX_ENTRIES_PER_REQUEST),
            leader_commit: self.log.commit_index(),
        }
    }

    /// Folds one peer's reply into the progress cursors.
    pub(crate) fn record_append_reply(
        &mut self,
        peer: NodeId,
        sent_up_to: LogIndex,
        reply: &AppendEntriesReply,
    ) {
        if reply.success {
            let matched = self.match_index.get(&peer).copied().unwrap_or(0).max(sent_up_to);
            self.match_index.insert(peer, matched);
            self.next_index.insert(peer, matched + 1);
            debug!(id = self.id, term = self.current_term, peer, matched, "peer caught up");
        } else if let Some(conflict_index) = reply.conflict_index {
            let next = conflict_index.max(1);
            self.next_index.insert(peer, next);
            debug!(id = self.id, term = self.current_term, peer, conflict_index, next, "peer diverges, backing off");
        }
    }

    /// Commits the highest current-term index held by a quorum, then applies
    /// up to it. Entries from earlier terms only commit along with it.
    pub(crate) fn advance_commit(&mut self) -> bool {
        let needed = quorum(self.peers.len());
        let mut candidate = self.log.last_index();
        while candidate > self.log.commit_index() {
            match self.log.term_at(candidate) {
                Some(term) if term == self.current_term => {}
                _ => break,
            }
            let replicas = 1 + self
                .peers
                .iter()
                .filter(|&p| self.match_index.get(p).copied().unwrap_or(0) >= candidate)
                .count();
            if replicas >= needed {
                let old = self.log.commit_index();
                self.log.advance_commit(candidate);
                let applied = self.apply_committed();
                self.record_commit_index();
                info!(id = self.id, term = self.current_term, old, commit_index = candidate, applied, "commit index advanced");
                return true;
            }
            candidate -= 1;
        }
        false
    }
}

impl RaftNode {
    /// One replication round: ship each peer its missing suffix (or a bare
    /// heartbeat) in parallel, fold in the replies as they arrive, then try
    /// to advance the commit index. A no-op unless this node leads.
    pub async fn replicate_to_all(&self) -> Result<(), RaftError> {
        let (term, requests) = {
            let s = self.lock().await;
            if s.role != Role::Leader {
                return Ok(());
            }
            let requests: Vec<_> = s
                .peers
                .iter()
                .map(|&peer| (peer, s.append_request_for(peer)))
                .collect();
            (s.current_term, requests)
        };

        let mut pending = JoinSet::new();
        for (peer, args) in requests {
            let transport = Arc::clone(&self.inner.transport);
            let sent_up_to = args.prev_log_index + args.entries.len() as u64;
            pending.spawn(async move { (peer, sent_up_to, transport.append_entries(peer, args).await) });
        }

        while let Some(joined) = pending.join_next().await {
            let (peer, sent_up_to, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(id = self.id(), term, error = %e, "append task failed");
                    continue;
                }
            };
            let reply = match result {
                Ok(reply) => reply,
                Err(e) => {
                    debug!(id = self.id(), term, peer, error = %e, "no append reply this round");
                    continue;
                }
            };
            let mut s = self.lock().await;
            if reply.term > s.current_term {
                pending.abort_all();
                info!(id = s.id, term = s.current_term, peer, peer_term = reply.term, "newer term in append reply, stepping down");
                return self.become_follower(&mut s, reply.term, None);
            }
            if s.role != Role::Leader || s.current_term != term {
                pending.abort_all();
                return Ok(());
            }
            s.record_append_reply(peer, sent_up_to, &reply);
            // Commit as soon as a quorum is in; stragglers cannot undo it.
            if reply.success {
                s.advance_commit();
            }
        }

        let mut s = self.lock().await;
        if s.role == Role::Leader && s.current_term == term {
            s.advance_commit();
        }
        Ok(())
    }

    /// Inbound AppendEntries.
    ///
    /// Any request that passes the term check counts as leader contact and
    /// re-arms the election timer, even when the consistency check then
    /// fails.
    pub async fn handle_append_entries(
        &self,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply, RaftError> {
        validate_append_entries(&args)?;
        let mut s = self.lock().await;
        if args.term < s.current_term {
            debug!(id = s.id, term = s.current_term, leader = args.leader_id, leader_term = args.term, "append rejected: stale term");
            return Ok(AppendEntriesReply::rejected(s.current_term));
        }
        if args.term > s.current_term {
            self.become_follower(&mut s, args.term, Some(args.leader_id))?;
        } else {
            let role = s.role;
            match role {
                Role::Follower => s.leader_id = Some(args.leader_id),
                Role::Candidate => self.become_follower(&mut s, args.term, Some(args.leader_id))?,
                Role::Leader => {
                    warn!(id = s.id, term = s.current_term, other = args.leader_id, "second leader claims this term");
                    return Ok(AppendEntriesReply::rejected(s.current_term));
                }
            }
        }
        self.arm_election_timer(&mut s);

        if !s.log.matches(args.prev_log_index, args.prev_log_term) {
            let conflict_index = s.log.conflict_index(args.prev_log_index);
            debug!(
                id = s.id,
                term = s.current_term,
                prev_log_index = args.prev_log_index,
                prev_log_term = args.prev_log_term,
                local_last = s.log.last_index(),
                conflict_index,
                "append rejected: log mismatch"
            );
            return Ok(AppendEntriesReply {
                term: s.current_term,
                success: false,
                conflict_index: Some(conflict_index),
                last_index: None,
            });
        }

        if let Some(next) = s.log.reconciled(args.prev_log_index, &args.entries) {
            let old_len = s.log.last_index();
            s.replace_log(next)?;
            debug!(id = s.id, term = s.current_term, old_len, new_len = s.log.last_index(), "log reconciled");
        }

        // Only what this request vouched for may be committed; anything past
        // it could be a stale suffix the leader has not reached yet.
        let verified_up_to = args.prev_log_index + args.entries.len() as u64;
        if s.log.advance_commit(args.leader_commit.min(verified_up_to)) {
            s.apply_committed();
            s.record_commit_index();
            debug!(id = s.id, term = s.current_term, commit_index = s.log.commit_index(), "follower commit advanced");
        }

        Ok(AppendEntriesReply {
            term: s.current_term,
            success: true,
            conflict_index: None,
            last_index: Some(s.log.last_index()),
        })
    }
}
