//! Snapshot Persistence
//!
//! State survives restarts as whole-file snapshots under the data directory.
//! Every write goes to a sibling temp file, is fsynced, then renamed over the
//! target, so a crash mid-write leaves the previous snapshot intact.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::change_detector::StateCache;

/// Change-detection state, JSON
pub const STATE_FILE: &str = "state_cache.json";
/// Field cache, bincode
pub const CACHE_FILE: &str = "field_cache.bin";

#[derive(Error, Debug, Clone)]
pub enum PersistError {
    #[error("Failed to serialize snapshot: {0}")]
    SerializationError(String),

    #[error("Failed to deserialize snapshot: {0}")]
    DeserializationError(String),

    #[error("Failed to write snapshot file: {0}")]
    WriteError(String),

    #[error("Failed to read snapshot file: {0}")]
    ReadError(String),

    #[error("Failed to create directory: {0}")]
    DirectoryError(String),
}

/// Outcome of loading a snapshot at startup
#[derive(Debug, Clone)]
pub enum RecoveryStatus<T> {
    /// No snapshot on disk
    Missing,
    Recovered(T),
    /// Snapshot unreadable; the caller starts empty
    Corrupted(String),
}

impl<T> RecoveryStatus<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            RecoveryStatus::Recovered(value) => Some(value),
            _ => None,
        }
    }
}

/// Replace `path` with `bytes` via temp file, fsync and rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| PersistError::DirectoryError(e.to_string()))?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = fs::File::create(&tmp).map_err(|e| PersistError::WriteError(e.to_string()))?;
    file.write_all(bytes)
        .map_err(|e| PersistError::WriteError(e.to_string()))?;
    file.sync_all()
        .map_err(|e| PersistError::WriteError(e.to_string()))?;
    drop(file);

    fs::rename(&tmp, path).map_err(|e| PersistError::WriteError(e.to_string()))
}

pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistError> {
    let content = serde_json::to_vec_pretty(value)
        .map_err(|e| PersistError::SerializationError(e.to_string()))?;
    write_atomic(path, &content)
}

pub fn load_json<T: DeserializeOwned>(path: &Path) -> RecoveryStatus<T> {
    match read_bytes(path) {
        Ok(None) => RecoveryStatus::Missing,
        Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
            Ok(value) => RecoveryStatus::Recovered(value),
            Err(e) => RecoveryStatus::Corrupted(e.to_string()),
        },
        Err(e) => RecoveryStatus::Corrupted(e.to_string()),
    }
}

pub fn save_bincode<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistError> {
    let content =
        bincode::serialize(value).map_err(|e| PersistError::SerializationError(e.to_string()))?;
    write_atomic(path, &content)
}

pub fn load_bincode<T: DeserializeOwned>(path: &Path) -> RecoveryStatus<T> {
    match read_bytes(path) {
        Ok(None) => RecoveryStatus::Missing,
        Ok(Some(bytes)) => match bincode::deserialize(&bytes) {
            Ok(value) => RecoveryStatus::Recovered(value),
            Err(e) => RecoveryStatus::Corrupted(e.to_string()),
        },
        Err(e) => RecoveryStatus::Corrupted(e.to_string()),
    }
}

fn read_bytes(path: &Path) -> Result<Option<Vec<u8>>, PersistError> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path).map_err(|e| PersistError::ReadError(e.to_string()))?;
    if bytes.is_empty() {
        return Ok(None);
    }
    Ok(Some(bytes))
}

/// Snapshot locations under one data directory
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    data_dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join(STATE_FILE)
    }

    pub fn cache_path(&self) -> PathBuf {
        self.data_dir.join(CACHE_FILE)
    }

    pub fn save_state(&self, state: &StateCache) -> Result<(), PersistError> {
        save_json(&self.state_path(), state)?;
        tracing::debug!(
            active = state.active_len(),
            retired = state.retired_len(),
            "State snapshot written"
        );
        Ok(())
    }

    /// Load the change-detection state, starting empty when missing or corrupt.
    pub fn load_state(&self) -> StateCache {
        match load_json::<StateCache>(&self.state_path()) {
            RecoveryStatus::Recovered(state) => {
                tracing::info!(
                    active = state.active_len(),
                    retired = state.retired_len(),
                    "State snapshot recovered"
                );
                state
            }
            RecoveryStatus::Missing => StateCache::new(),
            RecoveryStatus::Corrupted(reason) => {
                tracing::warn!(%reason, path = %self.state_path().display(), "State snapshot corrupted, starting empty");
                StateCache::new()
            }
        }
    }
}
