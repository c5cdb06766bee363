//! Indexer checkpoint: last applied sequence and the source position it came from.
//!
//! Written after every apply. On startup the stored checkpoint is reconciled
//! against the mirror tip, and the mirror wins: a crash between apply and
//! checkpoint write leaves the mirror ahead, never behind.

use crate::entry::{MirrorRecord, SourcePosition};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Progress marker owned by the indexer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_applied_sequence: Option<u64>,
    pub last_applied_position: Option<SourcePosition>,
}

impl Checkpoint {
    /// Nothing applied yet; subscribe from the source's origin.
    pub fn origin() -> Self {
        Self::default()
    }

    pub fn at(record: &MirrorRecord) -> Self {
        Self {
            last_applied_sequence: Some(record.sequence()),
            last_applied_position: Some(record.position.clone()),
        }
    }

    /// Checkpoint implied by the mirror tip.
    pub fn from_tip(tip: Option<&MirrorRecord>) -> Self {
        tip.map(Self::at).unwrap_or_default()
    }

    /// Pick the checkpoint to resume from given what was stored and what the mirror holds.
    pub fn reconcile(stored: Option<Checkpoint>, tip: Option<&MirrorRecord>) -> Checkpoint {
        let derived = Self::from_tip(tip);
        match stored {
            Some(stored) if stored == derived => stored,
            Some(stored) => {
                tracing::warn!(
                    stored = ?stored.last_applied_sequence,
                    mirror = ?derived.last_applied_sequence,
                    "checkpoint disagrees with mirror, re-deriving from mirror tip"
                );
                derived
            }
            None => derived,
        }
    }

    /// Sequence the next applied entry must carry.
    pub fn next_sequence(&self, first_sequence: u64) -> u64 {
        self.last_applied_sequence
            .map(|s| s + 1)
            .unwrap_or(first_sequence)
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint {path} is not valid JSON: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("checkpoint for {path} could not be encoded: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("checkpoint lock poisoned")]
    Poisoned,
}

/// Durable home of the checkpoint.
pub trait CheckpointStore: Send + Sync {
    fn load(&self) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Replace the stored checkpoint atomically.
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;
}

/// Keeps the checkpoint in memory. For tests and for stores that derive everything from the mirror.
#[derive(Debug, Default)]
pub struct MemoryCheckpoint {
    inner: Mutex<Option<Checkpoint>>,
}

impl MemoryCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(checkpoint: Checkpoint) -> Self {
        Self {
            inner: Mutex::new(Some(checkpoint)),
        }
    }
}

impl CheckpointStore for MemoryCheckpoint {
    fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.inner.lock().map_err(|_| CheckpointError::Poisoned)?.clone())
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        *self.inner.lock().map_err(|_| CheckpointError::Poisoned)? = Some(checkpoint.clone());
        Ok(())
    }
}

/// Checkpoint as a small JSON file, replaced via write-temp, fsync, rename.
#[derive(Debug, Clone)]
pub struct FileCheckpoint {
    path: PathBuf,
}

impl FileCheckpoint {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn io(&self, source: std::io::Error) -> CheckpointError {
        CheckpointError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl CheckpointStore for FileCheckpoint {
    fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io(e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| CheckpointError::Decode {
                path: self.path.clone(),
                source,
            })
    }

    fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let bytes = serde_json::to_vec(checkpoint).map_err(|source| CheckpointError::Encode {
            path: self.path.clone(),
            source,
        })?;
        let tmp = self.path.with_extension("tmp");
        let mut file = File::create(&tmp).map_err(|e| self.io(e))?;
        file.write_all(&bytes).map_err(|e| self.io(e))?;
        file.sync_all().map_err(|e| self.io(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io(e))?;
        sync_parent_dir(&self.path).map_err(|e| self.io(e))
    }
}

/// Flush the directory entry after a rename so the new file survives power loss.
#[cfg(unix)]
pub(crate) fn sync_parent_dir(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => File::open(dir)?.sync_all(),
        _ => File::open(".")?.sync_all(),
    }
}

#[cfg(not(unix))]
pub(crate) fn sync_parent_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
