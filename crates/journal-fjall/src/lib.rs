//! Decision log stored in a fjall keyspace
//!
//! Each outstanding decision is one key in the `decisions` partition, keyed
//! by the encoded xid. A completion deletes the key, so the partition only
//! ever holds what recovery has to re-drive.

use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tmx_journal::{DecisionRecord, Journal, JournalEntry, JournalError, Result};

const DECISIONS: &str = "decisions";

/// Configuration for the fjall journal
#[derive(Clone)]
pub struct JournalConfig {
    /// Directory for the keyspace
    pub data_dir: PathBuf,

    /// Block cache size for Fjall (in bytes)
    pub block_cache_size: u64,

    /// How far a flush pushes data towards the disk
    pub persist_mode: PersistMode,
}

impl JournalConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            block_cache_size: 8 * 1024 * 1024,
            persist_mode: PersistMode::SyncAll,
        }
    }

    pub fn with_block_cache_size(mut self, size: u64) -> Self {
        self.block_cache_size = size;
        self
    }

    pub fn with_persist_mode(mut self, mode: PersistMode) -> Self {
        self.persist_mode = mode;
        self
    }
}

fn storage(e: fjall::Error) -> JournalError {
    JournalError::Storage(e.to_string())
}

/// Journal backed by fjall
pub struct FjallJournal {
    keyspace: Keyspace,
    decisions: PartitionHandle,
    persist_mode: PersistMode,
    buffer: Vec<JournalEntry>,
}

impl FjallJournal {
    pub fn open(config: JournalConfig) -> Result<Self> {
        Self::open_at_path(&config.data_dir, config.block_cache_size, config.persist_mode)
    }

    fn open_at_path(path: &Path, cache_size: u64, persist_mode: PersistMode) -> Result<Self> {
        std::fs::create_dir_all(path)?;

        let keyspace = fjall::Config::new(path)
            .cache_size(cache_size)
            .open()
            .map_err(storage)?;
        let decisions = keyspace
            .open_partition(DECISIONS, PartitionCreateOptions::default())
            .map_err(storage)?;

        tracing::info!("opened decision journal at {}", path.display());

        Ok(Self {
            keyspace,
            decisions,
            persist_mode,
            buffer: Vec::new(),
        })
    }
}

impl Journal for FjallJournal {
    fn append(&mut self, entry: JournalEntry) -> Result<()> {
        self.buffer.push(entry);
        Ok(())
    }

    fn unflushed(&self) -> usize {
        self.buffer.len()
    }

    fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        // One write per key: the last entry for an xid wins
        let mut final_state: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();
        for entry in &self.buffer {
            let key = entry.xid().to_bytes().to_vec();
            let value = match entry {
                JournalEntry::Decision(record) => Some(record.to_bytes()?),
                JournalEntry::Completed(_) => None,
            };
            final_state.insert(key, value);
        }

        let mut batch = self.keyspace.batch();
        for (key, value) in final_state {
            match value {
                Some(value) => batch.insert(&self.decisions, key, value),
                None => batch.remove(&self.decisions, key),
            }
        }

        batch.commit().map_err(storage)?;
        self.keyspace.persist(self.persist_mode).map_err(storage)?;

        tracing::debug!("flushed {} journal entries", self.buffer.len());
        self.buffer.clear();
        Ok(())
    }

    fn outstanding(&self) -> Result<Vec<DecisionRecord>> {
        let mut records = Vec::new();
        for item in self.decisions.iter() {
            let (_, value) = item.map_err(storage)?;
            records.push(DecisionRecord::from_bytes(&value)?);
        }
        Ok(records)
    }
}
