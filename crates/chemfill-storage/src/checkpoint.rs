//! Checkpoint store: the durable set of completed row indices.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chemfill_core::CheckpointState;
use chrono::Utc;
use serde::Deserialize;
use tokio::fs;
use tracing::{debug, info};

use crate::{write_atomically, StorageError};

/// Persistence seam for checkpoint state.
#[async_trait]
pub trait CheckpointBackend: Send + Sync {
    /// Previously saved state, or `None` when nothing has been saved yet.
    async fn load(&self) -> Result<Option<CheckpointState>, StorageError>;

    /// Durably replace the saved state. Must never leave a partial write behind.
    async fn save(&self, state: &CheckpointState) -> Result<(), StorageError>;

    fn location(&self) -> String;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CheckpointFile {
    Current(CheckpointState),
    Legacy { last_row: usize },
}

/// JSON checkpoint file replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct FileCheckpoint {
    path: PathBuf,
}

impl FileCheckpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CheckpointBackend for FileCheckpoint {
    async fn load(&self) -> Result<Option<CheckpointState>, StorageError> {
        let exists = fs::try_exists(&self.path)
            .await
            .map_err(|e| StorageError::io("checking checkpoint", &self.path, e))?;
        if !exists {
            return Ok(None);
        }
        let text = fs::read_to_string(&self.path)
            .await
            .map_err(|e| StorageError::io("reading checkpoint", &self.path, e))?;
        let parsed: CheckpointFile =
            serde_json::from_str(&text).map_err(|source| StorageError::Decode {
                path: self.path.clone(),
                source,
            })?;
        let state = match parsed {
            CheckpointFile::Current(state) => state,
            CheckpointFile::Legacy { last_row } => {
                info!(
                    path = %self.path.display(),
                    last_row,
                    "upgrading legacy progress file to completed-set checkpoint"
                );
                CheckpointState::from_completed((0..last_row).collect(), Utc::now())
            }
        };
        Ok(Some(state))
    }

    async fn save(&self, state: &CheckpointState) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(state).map_err(|source| StorageError::Encode {
            what: "checkpoint state",
            source,
        })?;
        write_atomically(&self.path, &bytes).await
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory view of completed rows plus the backend that makes them durable.
///
/// Mutation takes `&mut self`; the result writer is the only owner.
pub struct CheckpointStore {
    backend: Box<dyn CheckpointBackend>,
    state: CheckpointState,
    dirty: bool,
}

impl CheckpointStore {
    pub async fn load(backend: Box<dyn CheckpointBackend>) -> Result<Self, StorageError> {
        let state = match backend.load().await? {
            Some(mut state) => {
                state.recompute();
                state
            }
            None => CheckpointState::empty(Utc::now()),
        };
        info!(
            location = %backend.location(),
            completed = state.len(),
            last_contiguous = ?state.last_contiguous,
            "checkpoint loaded"
        );
        Ok(Self {
            backend,
            state,
            dirty: false,
        })
    }

    pub async fn open_file(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        Self::load(Box::new(FileCheckpoint::new(path))).await
    }

    pub fn is_complete(&self, index: usize) -> bool {
        self.state.is_complete(index)
    }

    /// Idempotent. Returns `true` only the first time `index` is recorded.
    pub fn mark_complete(&mut self, index: usize) -> bool {
        let inserted = self.state.insert(index, Utc::now());
        if inserted {
            self.dirty = true;
        }
        inserted
    }

    pub fn state(&self) -> &CheckpointState {
        &self.state
    }

    pub fn snapshot(&self) -> CheckpointState {
        self.state.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn location(&self) -> String {
        self.backend.location()
    }

    /// Write the current state if it changed since the last successful save.
    pub async fn persist(&mut self) -> Result<(), StorageError> {
        if !self.dirty {
            return Ok(());
        }
        self.backend.save(&self.state).await?;
        self.dirty = false;
        debug!(
            completed = self.state.len(),
            last_contiguous = ?self.state.last_contiguous,
            "checkpoint persisted"
        );
        Ok(())
    }
}
