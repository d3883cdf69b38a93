use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::cdc_error;
use crate::error::{CdcError, CdcResult, ErrorKind};
use crate::store::state::{Checkpoint, StateStore};

/// Contents of the state file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    slots: BTreeMap<String, Checkpoint>,
}

/// State store keeping checkpoints of all slots in one JSON file.
///
/// Every write goes to a sibling temporary file which is synced and then renamed over the
/// state file. The directory is synced after the rename, so once a store returns the new
/// checkpoint survives a crash, and a crash during the store leaves the old one.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: Arc<PathBuf>,
    write_lock: Arc<Mutex<()>>,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::new(path.into()),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    async fn read_state_file(&self) -> CdcResult<StateFile> {
        let contents = match fs::read(self.path.as_path()).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(StateFile::default()),
            Err(err) => return Err(store_io_error("Failed to read state file", err)),
        };

        serde_json::from_slice(&contents).map_err(|err| {
            cdc_error!(
                ErrorKind::DeserializationError,
                "State file is not valid",
                format!("{}: {err}", self.path.display()),
                source: err
            )
        })
    }

    async fn write_state_file(&self, state: &StateFile) -> CdcResult<()> {
        let contents = serde_json::to_vec_pretty(state)?;

        let mut temp_path = self.path.as_os_str().to_owned();
        temp_path.push(".tmp");
        let temp_path = PathBuf::from(temp_path);

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|err| store_io_error("Failed to create temporary state file", err))?;
        file.write_all(&contents)
            .await
            .map_err(|err| store_io_error("Failed to write temporary state file", err))?;
        file.sync_all()
            .await
            .map_err(|err| store_io_error("Failed to sync temporary state file", err))?;
        drop(file);

        fs::rename(&temp_path, self.path.as_path())
            .await
            .map_err(|err| store_io_error("Failed to replace state file", err))?;

        sync_parent_dir(&self.path).await
    }
}

/// Syncs the directory holding `path`, making a rename into it durable.
async fn sync_parent_dir(path: &Path) -> CdcResult<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    fs::File::open(dir)
        .await
        .map_err(|err| store_io_error("Failed to open state directory", err))?
        .sync_all()
        .await
        .map_err(|err| store_io_error("Failed to sync state directory", err))
}

fn store_io_error(description: &'static str, err: io::Error) -> CdcError {
    cdc_error!(ErrorKind::StateStoreIoError, description, err.to_string(), source: err)
}

impl StateStore for FileStateStore {
    async fn load_checkpoint(&self, slot_name: &str) -> CdcResult<Option<Checkpoint>> {
        let state = self.read_state_file().await?;
        Ok(state.slots.get(slot_name).cloned())
    }

    async fn store_checkpoint(&self, slot_name: &str, checkpoint: Checkpoint) -> CdcResult<()> {
        let _guard = self.write_lock.lock().await;

        let mut state = self.read_state_file().await?;
        debug!(slot_name, position = %checkpoint.position, path = %self.path.display(), "storing checkpoint");
        state.slots.insert(slot_name.to_string(), checkpoint);

        self.write_state_file(&state).await
    }
}
