//! In-memory write-ahead log

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use flowmonkey_core::WalEntry;

use crate::stores::{StoreError, WriteAheadLog};

/// In-memory implementation of [`WriteAheadLog`]
///
/// Entries stay in append order; acked entries remain until compaction.
#[derive(Default)]
pub struct InMemoryWal {
    entries: RwLock<Vec<WalEntry>>,
}

impl InMemoryWal {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unacked entries
    pub fn unacked_count(&self) -> usize {
        self.entries.read().iter().filter(|e| !e.acked).count()
    }

    /// Total entries including acked
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the log holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl WriteAheadLog for InMemoryWal {
    async fn append(&self, entry: WalEntry) -> Result<(), StoreError> {
        self.entries.write().push(entry);
        Ok(())
    }

    async fn read_pending(&self, limit: usize) -> Result<Vec<WalEntry>, StoreError> {
        let entries = self.entries.read();
        Ok(entries
            .iter()
            .filter(|e| !e.acked)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn ack(&self, entry_id: Uuid) -> Result<bool, StoreError> {
        let mut entries = self.entries.write();
        match entries.iter_mut().find(|e| e.id == entry_id && !e.acked) {
            Some(entry) => {
                entry.acked = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_failure(&self, entry_id: Uuid, error: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write();
        let entry = entries
            .iter_mut()
            .find(|e| e.id == entry_id)
            .ok_or(StoreError::WalEntryNotFound(entry_id))?;

        entry.attempts += 1;
        entry.error = error.to_string();
        Ok(())
    }

    async fn compact(&self) -> Result<u32, StoreError> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|e| !e.acked);
        Ok((before - entries.len()) as u32)
    }
}
