//! Checkpoint store trait and JSON file implementation

use crate::checkpoint::record::{CheckpointRecord, CHECKPOINT_VERSION};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Name of the checkpoint file inside a repository's output folder
pub const CHECKPOINT_FILE: &str = ".checkpoint.json";

/// Errors that can occur during checkpoint operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Checkpoint is corrupt: {0}")]
    CheckpointCorrupt(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for checkpoint operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for checkpoint backends
///
/// Implementations must make `save` atomic: a reader sees either the previous
/// record or the new one, never a partial write.
pub trait CheckpointStore: Send + Sync {
    /// Persists a record, replacing the previous one
    fn save(&self, record: &CheckpointRecord) -> StorageResult<()>;

    /// Loads the last record
    ///
    /// # Returns
    ///
    /// * `Ok(Some(record))` - A usable record exists
    /// * `Ok(None)` - No record, or the record is corrupt or belongs to another
    ///   repository or format version
    fn load(&self) -> StorageResult<Option<CheckpointRecord>>;

    /// Deletes the record
    fn clear(&self) -> StorageResult<()>;
}

/// Checkpoint store backed by a single JSON file
pub struct JsonCheckpointStore {
    path: PathBuf,
    repository: String,
    write_lock: Mutex<()>,
}

impl JsonCheckpointStore {
    /// Creates a store for `repository` (`owner/name`) in `folder`
    pub fn new(folder: &Path, repository: impl Into<String>) -> Self {
        Self {
            path: folder.join(CHECKPOINT_FILE),
            repository: repository.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("json.tmp")
    }

    fn check(&self, record: &CheckpointRecord) -> StorageResult<()> {
        if record.version != CHECKPOINT_VERSION {
            return Err(StorageError::CheckpointCorrupt(format!(
                "unsupported version {}",
                record.version
            )));
        }
        if record.repository != self.repository {
            return Err(StorageError::CheckpointCorrupt(format!(
                "record belongs to {}",
                record.repository
            )));
        }
        Ok(())
    }
}

impl CheckpointStore for JsonCheckpointStore {
    fn save(&self, record: &CheckpointRecord) -> StorageResult<()> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let bytes = serde_json::to_vec_pretty(record)?;
        let temp = self.temp_path();
        {
            let mut file = File::create(&temp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;

        tracing::debug!("Checkpoint saved to {}", self.path.display());
        Ok(())
    }

    fn load(&self) -> StorageResult<Option<CheckpointRecord>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let parsed = serde_json::from_str::<CheckpointRecord>(&content)
            .map_err(|e| StorageError::CheckpointCorrupt(e.to_string()))
            .and_then(|record| self.check(&record).map(|_| record));

        match parsed {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::warn!("Ignoring checkpoint {}: {}", self.path.display(), e);
                Ok(None)
            }
        }
    }

    fn clear(&self) -> StorageResult<()> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        for path in [self.path.clone(), self.temp_path()] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
