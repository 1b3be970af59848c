use crate::error::{Error, Result};
use crate::state::{JournalEntry, State};
use crate::storage::Storage;

/// In-process storage: the journal and the last snapshot live in memory.
///
/// `fail_next_append` lets tests simulate a persistence failure.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Vec<JournalEntry>,
    snapshot: Option<(State, u64)>,
    fail_next_append: bool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }

    /// Make the next `append_entry` fail once.
    pub fn fail_next_append(&mut self) {
        self.fail_next_append = true;
    }

    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }
}

impl Storage for MemoryStorage {
    fn append_entry(&mut self, entry: &JournalEntry) -> Result<()> {
        if self.fail_next_append {
            self.fail_next_append = false;
            return Err(Error::Storage("simulated journal write failure".to_string()));
        }
        if entry.seq != self.entries.len() as u64 {
            return Err(Error::Storage(format!(
                "Journal gap: expected seq {}, got {}",
                self.entries.len(),
                entry.seq
            )));
        }
        self.entries.push(entry.clone());
        Ok(())
    }

    fn load_state(&self) -> Result<Option<(State, u64)>> {
        Ok(self.snapshot.clone())
    }

    fn persist_state(&mut self, state: &State, next_seq: u64) -> Result<()> {
        self.snapshot = Some((state.clone(), next_seq));
        Ok(())
    }

    fn load_entries_from(&self, from_seq: u64) -> Result<Vec<JournalEntry>> {
        let from = usize::try_from(from_seq).unwrap_or(usize::MAX);
        Ok(self.entries.iter().skip(from).cloned().collect())
    }
}
