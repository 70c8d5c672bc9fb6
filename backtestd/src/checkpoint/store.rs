//! Checkpoint persistence backends.
//!
//! The manager only sees the `CheckpointStore` trait. The bundled backend
//! keeps one JSON file per task under a data directory; the devkit provides
//! an in-memory implementation for tests.
//!
//! Lookups return `Ok(None)` / empty collections for "no checkpoint yet" and
//! reserve `Err(StoreError)` for real storage faults, so callers can never
//! mistake an outage for a cold start.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::debug;

use super::CheckpointData;

/// Storage faults, distinct from "nothing stored".
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid task id: {0:?}")]
    InvalidTaskId(String),
    #[error("checkpoint io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt checkpoint payload: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Durable checkpoint persistence keyed by (task, bar index).
pub trait CheckpointStore: Send + Sync {
    /// Persist one checkpoint. Checkpoints are immutable once written; a
    /// newer bar index supersedes, it never overwrites.
    fn append(&self, task_id: &str, checkpoint: &CheckpointData) -> Result<(), StoreError>;

    /// Checkpoint with the greatest bar index, if any.
    fn load_latest(&self, task_id: &str) -> Result<Option<CheckpointData>, StoreError>;

    /// All checkpoints for the task, newest first.
    fn load_all(&self, task_id: &str) -> Result<Vec<CheckpointData>, StoreError>;

    /// Remove every checkpoint for the task; returns how many were removed.
    fn delete(&self, task_id: &str) -> Result<u64, StoreError>;

    /// Keep only the `keep_count` newest checkpoints; returns how many were
    /// removed.
    fn cleanup_old(&self, task_id: &str, keep_count: usize) -> Result<u64, StoreError>;

    /// Number of checkpoints stored for the task.
    fn count(&self, task_id: &str) -> Result<u64, StoreError>;
}

/// One JSON file per task under a data directory.
pub struct JsonFileStore {
    data_dir: PathBuf,
    // Serializes read-modify-write cycles on the task files.
    write_guard: Mutex<()>,
}

impl JsonFileStore {
    pub fn new<P: Into<PathBuf>>(data_dir: P) -> Result<Self, StoreError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;
        debug!("checkpoint store at {:?}", data_dir);
        Ok(Self {
            data_dir,
            write_guard: Mutex::new(()),
        })
    }

    fn task_file(&self, task_id: &str) -> Result<PathBuf, StoreError> {
        validate_task_id(task_id)?;
        Ok(self.data_dir.join(format!("{task_id}.json")))
    }

    fn read_records(&self, path: &Path) -> Result<Vec<CheckpointData>, StoreError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn write_records(&self, path: &Path, records: &[CheckpointData]) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(records)?;
        fs::write(path, content)?;
        Ok(())
    }
}

impl CheckpointStore for JsonFileStore {
    fn append(&self, task_id: &str, checkpoint: &CheckpointData) -> Result<(), StoreError> {
        let path = self.task_file(task_id)?;
        let _guard = self.write_guard.lock();
        let mut records = self.read_records(&path)?;
        records.push(checkpoint.clone());
        records.sort_by_key(|c| c.bar_index);
        self.write_records(&path, &records)
    }

    fn load_latest(&self, task_id: &str) -> Result<Option<CheckpointData>, StoreError> {
        let path = self.task_file(task_id)?;
        let records = self.read_records(&path)?;
        Ok(records.into_iter().max_by_key(|c| c.bar_index))
    }

    fn load_all(&self, task_id: &str) -> Result<Vec<CheckpointData>, StoreError> {
        let path = self.task_file(task_id)?;
        let mut records = self.read_records(&path)?;
        records.sort_by(|a, b| b.bar_index.cmp(&a.bar_index));
        Ok(records)
    }

    fn delete(&self, task_id: &str) -> Result<u64, StoreError> {
        let path = self.task_file(task_id)?;
        let _guard = self.write_guard.lock();
        if !path.exists() {
            return Ok(0);
        }
        let removed = self.read_records(&path)?.len() as u64;
        fs::remove_file(&path)?;
        Ok(removed)
    }

    fn cleanup_old(&self, task_id: &str, keep_count: usize) -> Result<u64, StoreError> {
        let path = self.task_file(task_id)?;
        let _guard = self.write_guard.lock();
        let mut records = self.read_records(&path)?;
        if records.len() <= keep_count {
            return Ok(0);
        }
        records.sort_by_key(|c| c.bar_index);
        let excess = records.len() - keep_count;
        records.drain(..excess);
        self.write_records(&path, &records)?;
        Ok(excess as u64)
    }

    fn count(&self, task_id: &str) -> Result<u64, StoreError> {
        let path = self.task_file(task_id)?;
        Ok(self.read_records(&path)?.len() as u64)
    }
}

fn validate_task_id(task_id: &str) -> Result<(), StoreError> {
    let ok = !task_id.is_empty()
        && task_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidTaskId(task_id.to_string()))
    }
}
