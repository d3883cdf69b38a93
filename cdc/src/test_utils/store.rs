use std::sync::{Arc, Mutex};

use tokio_postgres::types::PgLsn;

use crate::bail;
use crate::error::{CdcResult, ErrorKind};
use crate::store::state::memory::MemoryStore;
use crate::store::state::{Checkpoint, StateStore};

/// A durability or acknowledgement step observed during a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalEntry {
    /// A checkpoint at this position was stored.
    Persisted(PgLsn),
    /// The slot's confirmed position moved to this position.
    Acknowledged(PgLsn),
}

/// Shared, ordered log of persists and acknowledgements.
///
/// Handed to both a [`JournalingStore`] and a [`crate::test_utils::slot::FakeSlotSource`] so
/// that the relative order of the two can be asserted.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<JournalEntry>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: JournalEntry) {
        self.entries.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn persisted(&self) -> Vec<PgLsn> {
        self.entries()
            .into_iter()
            .filter_map(|entry| match entry {
                JournalEntry::Persisted(position) => Some(position),
                JournalEntry::Acknowledged(_) => None,
            })
            .collect()
    }

    pub fn acknowledged(&self) -> Vec<PgLsn> {
        self.entries()
            .into_iter()
            .filter_map(|entry| match entry {
                JournalEntry::Acknowledged(position) => Some(position),
                JournalEntry::Persisted(_) => None,
            })
            .collect()
    }

    /// Returns the first acknowledgement that was not preceded by a persist at or beyond its
    /// position.
    pub fn first_unpersisted_acknowledgement(&self) -> Option<PgLsn> {
        let mut persisted: Option<PgLsn> = None;
        for entry in self.entries() {
            match entry {
                JournalEntry::Persisted(position) => {
                    persisted = persisted.max(Some(position));
                }
                JournalEntry::Acknowledged(position) => {
                    if persisted.is_none_or(|persisted| persisted < position) {
                        return Some(position);
                    }
                }
            }
        }

        None
    }
}

/// A [`MemoryStore`] that journals every stored checkpoint and can be told to start failing.
#[derive(Debug, Clone)]
pub struct JournalingStore {
    inner: MemoryStore,
    journal: Journal,
    /// Remaining successful stores before every store fails, unlimited when `None`.
    remaining_stores: Arc<Mutex<Option<usize>>>,
}

impl JournalingStore {
    pub fn new(journal: Journal) -> Self {
        Self::wrap(MemoryStore::new(), journal)
    }

    /// Journals the checkpoints stored in `inner`, keeping what it already holds.
    pub fn wrap(inner: MemoryStore, journal: Journal) -> Self {
        Self {
            inner,
            journal,
            remaining_stores: Arc::new(Mutex::new(None)),
        }
    }

    /// Lets `count` more checkpoints be stored, then fails every further store.
    pub fn fail_stores_after(&self, count: usize) {
        *self.remaining_stores.lock().unwrap() = Some(count);
    }

    pub fn memory_store(&self) -> &MemoryStore {
        &self.inner
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }
}

impl StateStore for JournalingStore {
    async fn load_checkpoint(&self, slot_name: &str) -> CdcResult<Option<Checkpoint>> {
        self.inner.load_checkpoint(slot_name).await
    }

    async fn store_checkpoint(&self, slot_name: &str, checkpoint: Checkpoint) -> CdcResult<()> {
        {
            let mut remaining = self.remaining_stores.lock().unwrap();
            match remaining.as_mut() {
                Some(0) => bail!(
                    ErrorKind::StateStoreIoError,
                    "Injected state store failure",
                    format!("Storing checkpoint {} failed", checkpoint.position)
                ),
                Some(count) => *count -= 1,
                None => {}
            }
        }

        let position = checkpoint.position;
        self.inner.store_checkpoint(slot_name, checkpoint).await?;
        self.journal.record(JournalEntry::Persisted(position));

        Ok(())
    }
}
