//! Player state persistence.
//!
//! Keeps the user-facing volume across restarts. A corrupt state file is set
//! aside and the last good backup is tried before falling back to defaults.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;

const STATE_VERSION: u32 = 1;

/// State files are a handful of bytes; anything larger is not ours.
const MAX_STATE_FILE_SIZE: u64 = 64 * 1024;

/// The part of the controller state that survives a restart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    /// Volume to restore; `None` means the configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<u8>,
}

#[derive(Debug, Error)]
pub enum StatePersistenceError {
    #[error("failed to create state directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("failed to write state file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to read state file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("corrupt state file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("state format version {found} is not supported (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },

    #[error("state file too large ({size} bytes, max {max} bytes)")]
    FileTooLarge { size: u64, max: u64 },
}

pub type StatePersistenceResult<T> = Result<T, StatePersistenceError>;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    version: u32,
    #[serde(flatten)]
    state: PersistentState,
}

/// Reads and writes [`PersistentState`] under a data directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    state_path: PathBuf,
    backup_path: PathBuf,
    corrupt_path: PathBuf,
}

impl StateStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            state_path: data_dir.join("state.json"),
            backup_path: data_dir.join("state.backup.json"),
            corrupt_path: data_dir.join("state.corrupt.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.state_path
    }

    /// Write `state`, keeping the previous file as a backup.
    pub fn save(&self, state: &PersistentState) -> StatePersistenceResult<()> {
        if let Some(parent) = self.state_path.parent() {
            fs::create_dir_all(parent).map_err(|source| StatePersistenceError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        if self.state_path.exists() {
            if let Err(e) = fs::copy(&self.state_path, &self.backup_path) {
                tracing::warn!(error = %e, "failed to back up player state; continuing anyway");
            }
        }

        let file =
            fs::File::create(&self.state_path).map_err(|source| StatePersistenceError::Write {
                path: self.state_path.clone(),
                source,
            })?;
        let persisted = PersistedState {
            version: STATE_VERSION,
            state: *state,
        };
        serde_json::to_writer_pretty(BufWriter::new(file), &persisted).map_err(|e| {
            StatePersistenceError::Write {
                path: self.state_path.clone(),
                source: io::Error::other(e),
            }
        })?;

        tracing::debug!(
            volume = ?state.volume,
            path = %self.state_path.display(),
            "saved player state"
        );
        Ok(())
    }

    /// Load the saved state. Missing or unreadable files yield the default
    /// state; a corrupt file is moved aside and the backup tried instead.
    pub fn load(&self) -> PersistentState {
        if !self.state_path.exists() {
            return PersistentState::default();
        }

        let err = match self.try_load(&self.state_path) {
            Ok(state) => return state,
            Err(err) => err,
        };
        tracing::warn!(
            error = %err,
            path = %self.state_path.display(),
            "player state is corrupt or unreadable"
        );
        if let Err(move_err) = fs::rename(&self.state_path, &self.corrupt_path) {
            tracing::warn!(error = %move_err, "failed to preserve corrupt state file");
        }

        if self.backup_path.exists() {
            match self.try_load(&self.backup_path) {
                Ok(state) => {
                    tracing::info!(volume = ?state.volume, "recovered player state from backup");
                    return state;
                }
                Err(backup_err) => {
                    tracing::warn!(error = %backup_err, "state backup also corrupt; using defaults");
                }
            }
        }
        PersistentState::default()
    }

    fn try_load(&self, path: &Path) -> StatePersistenceResult<PersistentState> {
        let size = fs::metadata(path)
            .map_err(|source| StatePersistenceError::Read {
                path: path.to_path_buf(),
                source,
            })?
            .len();
        if size > MAX_STATE_FILE_SIZE {
            return Err(StatePersistenceError::FileTooLarge {
                size,
                max: MAX_STATE_FILE_SIZE,
            });
        }

        let file = fs::File::open(path).map_err(|source| StatePersistenceError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let persisted: PersistedState = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| StatePersistenceError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        if persisted.version != STATE_VERSION {
            return Err(StatePersistenceError::UnsupportedVersion {
                found: persisted.version,
                expected: STATE_VERSION,
            });
        }
        if let Some(volume) = persisted.state.volume {
            if volume > 100 {
                return Err(StatePersistenceError::Corrupt {
                    path: path.to_path_buf(),
                    reason: format!("volume {volume} is out of range"),
                });
            }
        }
        Ok(persisted.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_and_load() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());

        store.save(&PersistentState { volume: Some(42) }).unwrap();
        assert_eq!(store.load(), PersistentState { volume: Some(42) });

        let raw = fs::read_to_string(store.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(value["volume"], 42);
    }

    #[test]
    fn missing_file_yields_default() {
        let dir = tempdir().unwrap();
        assert_eq!(StateStore::new(dir.path()).load(), PersistentState::default());
    }

    #[test]
    fn corrupt_file_is_preserved_and_backup_used() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.save(&PersistentState { volume: Some(10) }).unwrap();
        store.save(&PersistentState { volume: Some(20) }).unwrap();

        fs::write(&store.state_path, "{ not json").unwrap();

        assert_eq!(store.load(), PersistentState { volume: Some(10) });
        assert!(store.corrupt_path.exists());
    }

    #[test]
    fn out_of_range_volume_is_rejected() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        fs::write(&store.state_path, r#"{"version":1,"volume":250}"#).unwrap();

        assert_eq!(store.load(), PersistentState::default());
    }

    #[test]
    fn unknown_version_falls_back_to_default() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path());
        fs::write(&store.state_path, r#"{"version":9,"volume":50}"#).unwrap();

        assert_eq!(store.load(), PersistentState::default());
    }
}
