use crate::config::Config;
use crate::error::{Error, Result};
use crate::state::{JournalEntry, State};
use crate::storage::Storage;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;

/// File-based storage implementation using an append-only journal and snapshots.
///
/// Files:
/// - `journal.log`: Append-only journal (u64 LE length prefix + bincode entry)
/// - `state.bin`: State snapshot (bincode State + u64 LE next_seq)
/// - `state.bin.tmp`: Temporary file for atomic snapshot writes
pub struct FileStorage {
    journal_path: PathBuf,
    state_path: PathBuf,
    state_tmp_path: PathBuf,
}

impl FileStorage {
    /// Create a new FileStorage with paths from config
    pub fn new(config: &Config) -> Self {
        FileStorage::with_paths(config.get_journal_path(), config.get_state_path())
    }

    /// Create FileStorage with custom paths (for testing)
    pub fn with_paths(journal_path: PathBuf, state_path: PathBuf) -> Self {
        let state_tmp_path = state_path.with_extension("bin.tmp");
        FileStorage {
            journal_path,
            state_path,
            state_tmp_path,
        }
    }

    fn ensure_dir(&self) -> Result<()> {
        if let Some(parent) = self.journal_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("Failed to create data directory: {}", e)))?;
        }
        Ok(())
    }
}

impl Storage for FileStorage {
    fn append_entry(&mut self, entry: &JournalEntry) -> Result<()> {
        self.ensure_dir()?;

        let bytes = bincode::serialize(entry)
            .map_err(|e| Error::Storage(format!("Failed to serialize journal entry: {}", e)))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal_path)
            .map_err(|e| Error::Storage(format!("Failed to open journal for append: {}", e)))?;

        // One write for prefix + payload so a crash cannot interleave records
        let mut record = Vec::with_capacity(8 + bytes.len());
        record.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
        record.extend_from_slice(&bytes);
        file.write_all(&record)
            .map_err(|e| Error::Storage(format!("Failed to write journal entry: {}", e)))?;

        file.sync_all()
            .map_err(|e| Error::Storage(format!("Failed to fsync journal: {}", e)))?;

        Ok(())
    }

    fn load_state(&self) -> Result<Option<(State, u64)>> {
        if !self.state_path.exists() {
            return Ok(None);
        }

        let mut file = File::open(&self.state_path)
            .map_err(|e| Error::Storage(format!("Failed to open state file: {}", e)))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)
            .map_err(|e| Error::Storage(format!("Failed to read state file: {}", e)))?;

        // Format: [State bytes][next_seq: u64 LE]
        if data.len() < 8 {
            return Err(Error::Storage("State file too short".to_string()));
        }

        let (state_bytes, seq_bytes) = data.split_at(data.len() - 8);
        let mut seq_buf = [0u8; 8];
        seq_buf.copy_from_slice(seq_bytes);
        let next_seq = u64::from_le_bytes(seq_buf);

        let state: State = bincode::deserialize(state_bytes)
            .map_err(|e| Error::Storage(format!("Failed to deserialize state: {}", e)))?;

        Ok(Some((state, next_seq)))
    }

    fn persist_state(&mut self, state: &State, next_seq: u64) -> Result<()> {
        self.ensure_dir()?;

        let state_bytes = bincode::serialize(state)
            .map_err(|e| Error::Storage(format!("Failed to serialize state: {}", e)))?;

        let mut file = File::create(&self.state_tmp_path)
            .map_err(|e| Error::Storage(format!("Failed to create temp state file: {}", e)))?;

        file.write_all(&state_bytes)
            .map_err(|e| Error::Storage(format!("Failed to write state: {}", e)))?;
        file.write_all(&next_seq.to_le_bytes())
            .map_err(|e| Error::Storage(format!("Failed to write next_seq: {}", e)))?;

        // Fsync before rename
        file.sync_all()
            .map_err(|e| Error::Storage(format!("Failed to fsync temp state file: {}", e)))?;
        drop(file);

        fs::rename(&self.state_tmp_path, &self.state_path)
            .map_err(|e| Error::Storage(format!("Failed to rename temp state file: {}", e)))?;

        // Fsync parent directory so the rename itself is durable
        if let Some(parent) = self.state_path.parent() {
            let parent_file = File::open(parent)
                .map_err(|e| Error::Storage(format!("Failed to open parent directory: {}", e)))?;
            parent_file
                .sync_all()
                .map_err(|e| Error::Storage(format!("Failed to fsync parent directory: {}", e)))?;
        }

        Ok(())
    }

    fn load_entries_from(&self, from_seq: u64) -> Result<Vec<JournalEntry>> {
        if !self.journal_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.journal_path)
            .map_err(|e| Error::Storage(format!("Failed to open journal: {}", e)))?;
        let mut reader = BufReader::new(file);

        let mut entries = Vec::new();
        let mut current = 0u64;

        loop {
            let mut len_buf = [0u8; 8];
            match reader.read_exact(&mut len_buf) {
                Ok(_) => {
                    let len = u64::from_le_bytes(len_buf) as usize;
                    let mut buf = vec![0u8; len];
                    match reader.read_exact(&mut buf) {
                        Ok(_) => {}
                        // Torn tail from a crash mid-append: the entry was never acked
                        Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                            tracing::warn!(seq = current, "ignoring torn journal tail");
                            break;
                        }
                        Err(e) => {
                            return Err(Error::Storage(format!(
                                "Failed to read journal entry: {}",
                                e
                            )))
                        }
                    }

                    if current >= from_seq {
                        let entry: JournalEntry = bincode::deserialize(&buf).map_err(|e| {
                            Error::Storage(format!("Failed to deserialize journal entry: {}", e))
                        })?;
                        entries.push(entry);
                    }

                    current += 1;
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    break;
                }
                Err(e) => {
                    return Err(Error::Storage(format!("Failed to read journal: {}", e)));
                }
            }
        }

        Ok(entries)
    }
}
