//! Replay service: load state from storage and replay the journal to tip.

use crate::error::{Error, Result};
use crate::state::{JournalEntry, State};
use crate::storage::Storage;

/// Replay the journal from storage to current tip.
///
/// - If a snapshot exists: load it, then replay entries from `next_seq`.
/// - If no snapshot: replay from genesis (seq 0).
///
/// Returns the state and the seq the next appended entry must carry.
pub fn replay_to_tip<S: Storage>(storage: &S) -> Result<(State, u64)> {
    let (mut state, next_seq) = match storage.load_state()? {
        Some((snapshot, next_seq)) => (snapshot, next_seq),
        None => (State::new(), 0),
    };
    let entries = storage.load_entries_from(next_seq)?;
    let next_seq = apply_entries(&mut state, next_seq, &entries)?;
    Ok((state, next_seq))
}

/// Rebuild state from genesis, ignoring any snapshot. Used to audit a snapshot.
pub fn replay_from_genesis<S: Storage>(storage: &S) -> Result<(State, u64)> {
    let mut state = State::new();
    let entries = storage.load_entries_from(0)?;
    let next_seq = apply_entries(&mut state, 0, &entries)?;
    Ok((state, next_seq))
}

fn apply_entries(state: &mut State, mut next_seq: u64, entries: &[JournalEntry]) -> Result<u64> {
    for entry in entries {
        if entry.seq != next_seq {
            return Err(Error::Storage(format!(
                "Journal out of order: expected seq {}, found {}",
                next_seq, entry.seq
            )));
        }
        state.apply_event(&entry.event);
        next_seq += 1;
    }
    Ok(next_seq)
}
