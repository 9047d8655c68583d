use crate::core_types::LogEntry;
use crate::{LogIndex, Term};

/// In-memory copy of the replicated log plus the commit and apply cursors.
///
/// Entry `i` lives at `entries[i - 1]`; index 0 is the empty prefix with
/// term 0. The cursors only ever move forward and
/// `last_applied <= commit_index <= last_index` holds at all times.
#[derive(Debug, Default, Clone)]
pub struct ReplicatedLog {
    entries: Vec<LogEntry>,
    commit_index: LogIndex,
    last_applied: LogIndex,
}

impl ReplicatedLog {
    /// Rebuilds the log from what the durable store returned. A persisted
    /// commit index beyond the log is clamped.
    pub fn restore(entries: Vec<LogEntry>, commit_index: LogIndex) -> Self {
        let commit_index = commit_index.min(entries.len() as u64);
        ReplicatedLog {
            entries,
            commit_index,
            last_applied: 0,
        }
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries.len() as u64
    }

    pub fn last_term(&self) -> Term {
        self.entries.last().map_or(0, |e| e.term)
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get((index - 1) as usize)
    }

    /// Term of the entry at `index`; the empty prefix (index 0) has term 0.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            Some(0)
        } else {
            self.get(index).map(|e| e.term)
        }
    }

    /// Up to `max` entries starting at `next` (1-based).
    pub fn entries_from(&self, next: LogIndex, max: usize) -> Vec<LogEntry> {
        let start = next.max(1) as usize - 1;
        if start >= self.entries.len() {
            return Vec::new();
        }
        let end = (start + max).min(self.entries.len());
        self.entries[start..end].to_vec()
    }

    /// The entry a leader would append next for `command`.
    pub fn next_entry(&self, term: Term, command: String) -> LogEntry {
        LogEntry {
            index: self.last_index() + 1,
            term,
            command,
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.last_index() + 1);
        self.entries.push(entry);
    }

    /// Whether the local log has an entry at `prev_index` with `prev_term`.
    pub fn matches(&self, prev_index: LogIndex, prev_term: Term) -> bool {
        self.term_at(prev_index) == Some(prev_term)
    }

    /// Where a leader should retarget after a failed consistency check.
    pub fn conflict_index(&self, prev_index: LogIndex) -> LogIndex {
        prev_index.min(self.last_index())
    }

    /// Computes the log that results from applying `incoming` after
    /// `prev_index`, or `None` when every incoming entry is already present
    /// with the same term.
    ///
    /// The local log is cut at the first absent or term-divergent slot and
    /// the incoming suffix from that point is appended unmodified. Entries
    /// past the end of `incoming` are kept when nothing diverged.
    ///
    /// The caller must have checked `matches(prev_index, ..)` first.
    pub fn reconciled(&self, prev_index: LogIndex, incoming: &[LogEntry]) -> Option<Vec<LogEntry>> {
        let divergence = incoming.iter().enumerate().find_map(|(offset, entry)| {
            let index = prev_index + 1 + offset as u64;
            match self.term_at(index) {
                Some(term) if term == entry.term => None,
                _ => Some((offset, index)),
            }
        })?;
        let (offset, index) = divergence;
        let mut next = self.entries[..(index - 1) as usize].to_vec();
        next.extend_from_slice(&incoming[offset..]);
        Some(next)
    }

    /// Replaces the whole entry sequence. The commit cursor is never pulled
    /// back: committed entries are never part of a divergent suffix.
    pub fn replace(&mut self, entries: Vec<LogEntry>) {
        debug_assert!(entries.len() as u64 >= self.commit_index);
        self.entries = entries;
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    /// Moves the commit cursor forward to `index` (clamped to the log).
    /// Returns whether it moved.
    pub fn advance_commit(&mut self, index: LogIndex) -> bool {
        let index = index.min(self.last_index());
        if index > self.commit_index {
            self.commit_index = index;
            true
        } else {
            false
        }
    }

    /// Hands out the next committed-but-unapplied entry and marks it applied.
    pub fn next_to_apply(&mut self) -> Option<LogEntry> {
        if self.last_applied >= self.commit_index {
            return None;
        }
        let entry = self.get(self.last_applied + 1)?.clone();
        self.last_applied = entry.index;
        Some(entry)
    }

    /// Raft's "at least as up to date" comparison against a candidate's log.
    pub fn candidate_is_up_to_date(&self, last_log_term: Term, last_log_index: LogIndex) -> bool {
        let my_term = self.last_term();
        if last_log_term != my_term {
            return last_log_term > my_term;
        }
        last_log_index >= self.last_index()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_of(terms: &[Term]) -> ReplicatedLog {
        let entries = terms
            .iter()
            .enumerate()
            .map(|(i, &t)| LogEntry::new(i as u64 + 1, t, format!("c{}", i + 1)))
            .collect();
        ReplicatedLog::restore(entries, 0)
    }

    #[test]
    fn empty_log_has_zero_prefix() {
        let log = ReplicatedLog::default();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert!(log.matches(0, 0));
        assert!(!log.matches(1, 1));
        assert_eq!(log.conflict_index(5), 0);
    }

    #[test]
    fn entries_from_respects_bounds() {
        let log = log_of(&[1, 1, 2, 2]);
        assert_eq!(log.entries_from(1, 10).len(), 4);
        assert_eq!(log.entries_from(3, 10)[0].index, 3);
        assert_eq!(log.entries_from(2, 2).len(), 2);
        assert!(log.entries_from(5, 10).is_empty());
    }

    #[test]
    fn matching_entries_are_not_rewritten() {
        let log = log_of(&[1, 1, 2]);
        let incoming = log.entries()[1..].to_vec();
        assert_eq!(log.reconciled(1, &incoming), None);
        // A shorter, already-present batch leaves the tail alone.
        assert_eq!(log.reconciled(0, &log.entries()[..1]), None);
    }

    #[test]
    fn divergent_suffix_is_replaced() {
        let log = log_of(&[1, 1, 1, 1, 1]);
        let incoming = vec![LogEntry::new(3, 2, "x"), LogEntry::new(4, 2, "y")];
        let next = log.reconciled(2, &incoming).expect("log should change");
        let terms: Vec<_> = next.iter().map(|e| e.term).collect();
        assert_eq!(terms, vec![1, 1, 2, 2]);
        assert_eq!(next[2].command, "x");
    }

    #[test]
    fn new_entries_extend_the_log() {
        let log = log_of(&[1]);
        let incoming = vec![LogEntry::new(1, 1, "c1"), LogEntry::new(2, 1, "c2")];
        let next = log.reconciled(0, &incoming).expect("log should grow");
        assert_eq!(next.len(), 2);
        assert_eq!(next[0], log.entries()[0]);
    }

    #[test]
    fn commit_and_apply_cursors_move_forward_only() {
        let mut log = log_of(&[1, 1, 1]);
        assert!(log.advance_commit(2));
        assert!(!log.advance_commit(1));
        assert!(log.advance_commit(10));
        assert_eq!(log.commit_index(), 3);

        let applied: Vec<_> = std::iter::from_fn(|| log.next_to_apply()).map(|e| e.index).collect();
        assert_eq!(applied, vec![1, 2, 3]);
        assert_eq!(log.last_applied(), 3);
        assert!(log.next_to_apply().is_none());
    }

    #[test]
    fn restore_clamps_commit_index() {
        let log = ReplicatedLog::restore(vec![LogEntry::new(1, 1, "a")], 7);
        assert_eq!(log.commit_index(), 1);
        assert_eq!(log.last_applied(), 0);
    }

    #[test]
    fn up_to_date_compares_term_then_index() {
        let log = log_of(&[1, 2, 2]);
        assert!(log.candidate_is_up_to_date(3, 1));
        assert!(!log.candidate_is_up_to_date(1, 10));
        assert!(log.candidate_is_up_to_date(2, 3));
        assert!(!log.candidate_is_up_to_date(2, 2));
    }
}
