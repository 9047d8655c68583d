//! Boundary checks for inbound requests. A request that fails here never
//! reaches the node's state.

use crate::core_types::{AppendEntriesArgs, ClientRequest, RequestVoteArgs};
use crate::error::RaftError;

pub const MAX_ENTRIES_PER_REQUEST: usize = 1000;
pub const MAX_COMMAND_LEN: usize = 10_000;

pub fn validate_request_vote(args: &RequestVoteArgs) -> Result<(), RaftError> {
    if args.last_log_term > args.term {
        return Err(RaftError::validation(
            "last_log_term",
            format!(
                "last log term {} is ahead of request term {}",
                args.last_log_term, args.term
            ),
        ));
    }
    if args.last_log_index == 0 && args.last_log_term != 0 {
        return Err(RaftError::validation(
            "last_log_term",
            "must be 0 for an empty log",
        ));
    }
    Ok(())
}

pub fn validate_append_entries(args: &AppendEntriesArgs) -> Result<(), RaftError> {
    if args.entries.len() > MAX_ENTRIES_PER_REQUEST {
        return Err(RaftError::validation(
            "entries",
            format!(
                "{} entries exceeds the limit of {}",
                args.entries.len(),
                MAX_ENTRIES_PER_REQUEST
            ),
        ));
    }
    if args.prev_log_index == 0 && args.prev_log_term != 0 {
        return Err(RaftError::validation(
            "prev_log_term",
            "must be 0 when prev_log_index is 0",
        ));
    }
    if args.prev_log_term > args.term {
        return Err(RaftError::validation(
            "prev_log_term",
            format!(
                "prev log term {} is ahead of request term {}",
                args.prev_log_term, args.term
            ),
        ));
    }
    // Bounds every index computed below.
    if args
        .prev_log_index
        .checked_add(args.entries.len() as u64)
        .is_none()
    {
        return Err(RaftError::validation(
            "prev_log_index",
            format!(
                "{} entries after index {} run past the largest log index",
                args.entries.len(),
                args.prev_log_index
            ),
        ));
    }
    for (position, entry) in args.entries.iter().enumerate() {
        let expected = args.prev_log_index + 1 + position as u64;
        if entry.index != expected {
            return Err(RaftError::validation(
                "entries",
                format!(
                    "entry at position {} has index {}, expected {}",
                    position, entry.index, expected
                ),
            ));
        }
        if entry.term > args.term {
            return Err(RaftError::validation(
                "entries",
                format!(
                    "entry {} has term {} beyond request term {}",
                    entry.index, entry.term, args.term
                ),
            ));
        }
        if entry.command.len() > MAX_COMMAND_LEN {
            return Err(RaftError::validation(
                "entries",
                format!("command of entry {} is too long", entry.index),
            ));
        }
    }
    Ok(())
}

pub fn validate_client_request(request: &ClientRequest) -> Result<(), RaftError> {
    if request.command.is_empty() {
        return Err(RaftError::validation("command", "must not be empty"));
    }
    if request.command.len() > MAX_COMMAND_LEN {
        return Err(RaftError::validation(
            "command",
            format!("must be at most {} bytes", MAX_COMMAND_LEN),
        ));
    }
    Ok(())
}
