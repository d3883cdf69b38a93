use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::CdcResult;
use crate::store::state::{Checkpoint, StateStore};

#[derive(Debug, Default)]
struct Inner {
    checkpoints: HashMap<String, Vec<Checkpoint>>,
}

/// In-memory state store for tests and development.
///
/// Keeps the history of every stored checkpoint per slot, the last one being current.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every checkpoint stored for `slot_name`, oldest first.
    pub async fn checkpoints(&self, slot_name: &str) -> Vec<Checkpoint> {
        let inner = self.inner.lock().await;
        inner
            .checkpoints
            .get(slot_name)
            .cloned()
            .unwrap_or_default()
    }
}

impl StateStore for MemoryStore {
    async fn load_checkpoint(&self, slot_name: &str) -> CdcResult<Option<Checkpoint>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .checkpoints
            .get(slot_name)
            .and_then(|history| history.last().cloned()))
    }

    async fn store_checkpoint(&self, slot_name: &str, checkpoint: Checkpoint) -> CdcResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .checkpoints
            .entry(slot_name.to_string())
            .or_default()
            .push(checkpoint);

        Ok(())
    }
}
