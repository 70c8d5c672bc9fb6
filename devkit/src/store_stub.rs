//! In-memory checkpoint store for plugin tests.
//!
//! `MemoryCheckpointStore` mirrors the JSON file backend without touching
//! the filesystem; `FailingCheckpointStore` simulates a storage outage so
//! tests can assert that absence and failure stay distinct.

use std::collections::HashMap;

use parking_lot::Mutex;

use backtestd::checkpoint::store::{CheckpointStore, StoreError};
use backtestd::checkpoint::CheckpointData;

/// Checkpoint store held entirely in memory.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    tasks: Mutex<HashMap<String, Vec<CheckpointData>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn append(&self, task_id: &str, checkpoint: &CheckpointData) -> Result<(), StoreError> {
        let mut tasks = self.tasks.lock();
        let records = tasks.entry(task_id.to_string()).or_default();
        records.push(checkpoint.clone());
        records.sort_by_key(|c| c.bar_index);
        Ok(())
    }

    fn load_latest(&self, task_id: &str) -> Result<Option<CheckpointData>, StoreError> {
        let tasks = self.tasks.lock();
        Ok(tasks
            .get(task_id)
            .and_then(|records| records.last().cloned()))
    }

    fn load_all(&self, task_id: &str) -> Result<Vec<CheckpointData>, StoreError> {
        let tasks = self.tasks.lock();
        let mut records = tasks.get(task_id).cloned().unwrap_or_default();
        records.sort_by(|a, b| b.bar_index.cmp(&a.bar_index));
        Ok(records)
    }

    fn delete(&self, task_id: &str) -> Result<u64, StoreError> {
        let mut tasks = self.tasks.lock();
        Ok(tasks.remove(task_id).map(|r| r.len() as u64).unwrap_or(0))
    }

    fn cleanup_old(&self, task_id: &str, keep_count: usize) -> Result<u64, StoreError> {
        let mut tasks = self.tasks.lock();
        let Some(records) = tasks.get_mut(task_id) else {
            return Ok(0);
        };
        if records.len() <= keep_count {
            return Ok(0);
        }
        let excess = records.len() - keep_count;
        records.drain(..excess);
        Ok(excess as u64)
    }

    fn count(&self, task_id: &str) -> Result<u64, StoreError> {
        let tasks = self.tasks.lock();
        Ok(tasks.get(task_id).map(|r| r.len() as u64).unwrap_or(0))
    }
}

/// Store whose every operation fails, simulating an unreachable backend.
pub struct FailingCheckpointStore;

impl FailingCheckpointStore {
    fn outage() -> StoreError {
        StoreError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "simulated store outage",
        ))
    }
}

impl CheckpointStore for FailingCheckpointStore {
    fn append(&self, _task_id: &str, _checkpoint: &CheckpointData) -> Result<(), StoreError> {
        Err(Self::outage())
    }

    fn load_latest(&self, _task_id: &str) -> Result<Option<CheckpointData>, StoreError> {
        Err(Self::outage())
    }

    fn load_all(&self, _task_id: &str) -> Result<Vec<CheckpointData>, StoreError> {
        Err(Self::outage())
    }

    fn delete(&self, _task_id: &str) -> Result<u64, StoreError> {
        Err(Self::outage())
    }

    fn cleanup_old(&self, _task_id: &str, _keep_count: usize) -> Result<u64, StoreError> {
        Err(Self::outage())
    }

    fn count(&self, _task_id: &str) -> Result<u64, StoreError> {
        Err(Self::outage())
    }
}
