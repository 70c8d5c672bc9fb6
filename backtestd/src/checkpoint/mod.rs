//! Checkpoint/resume subsystem: periodic snapshots of simulation state and
//! the warmup-aware resume-point calculation.
//!
//! The manager decides *when* to save, stamps the snapshot metadata, and
//! enforces retention. Persistence goes through the `CheckpointStore` trait;
//! a failed save is reported as `false` and never aborts the running
//! backtest.

pub mod store;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use store::{CheckpointStore, StoreError};

/// Checkpoint policy, immutable for the life of the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub enabled: bool,
    /// Bars between saves.
    pub interval: u64,
    /// Maximum checkpoints retained per task.
    pub max_count: usize,
    /// Bars to replay for indicator warmup after a resume.
    pub warmup_period: u64,
    /// Delete a task's checkpoints once it completes.
    pub cleanup_on_complete: bool,
    /// Checkpoint format version stamped into every snapshot.
    pub format_version: u32,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 50,
            max_count: 5,
            warmup_period: 50,
            cleanup_on_complete: true,
            format_version: 1,
        }
    }
}

/// Snapshot kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    /// Periodic snapshot; resuming from it requires indicator warmup replay.
    Warmup,
    /// Terminal snapshot taken at the end of a run.
    Final,
}

/// Broker state at the checkpointed bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerState {
    pub cash: f64,
    pub value: f64,
    #[serde(default)]
    pub commission_paid: f64,
}

/// One open position at the checkpointed bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    pub symbol: String,
    pub size: f64,
    pub price: f64,
}

/// Complete snapshot of one task at one bar. Immutable once persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointData {
    pub task_id: String,
    pub bar_index: u64,
    pub kind: CheckpointKind,

    // Core state
    pub broker: Option<BrokerState>,
    #[serde(default)]
    pub positions: Vec<PositionState>,
    #[serde(default)]
    pub open_orders: Vec<serde_json::Value>,

    /// Strategy-specific indicator state, opaque to the checkpoint layer.
    pub strategy_state: Option<serde_json::Value>,
    /// Account metrics at the checkpointed bar.
    pub metrics: Option<HashMap<String, f64>>,

    // Metadata stamped by the manager on save
    pub warmup_period: u64,
    pub strategy_version: Option<String>,
    pub format_version: u32,
    pub created_at: Option<DateTime<Utc>>,
}

impl CheckpointData {
    /// Snapshot skeleton; the manager fills in the metadata on save.
    pub fn new(task_id: &str, bar_index: u64) -> Self {
        Self {
            task_id: task_id.to_string(),
            bar_index,
            kind: CheckpointKind::Warmup,
            broker: None,
            positions: Vec::new(),
            open_orders: Vec::new(),
            strategy_state: None,
            metrics: None,
            warmup_period: 0,
            strategy_version: None,
            format_version: 0,
            created_at: None,
        }
    }

    pub fn with_kind(mut self, kind: CheckpointKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_broker(mut self, broker: BrokerState) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn with_positions(mut self, positions: Vec<PositionState>) -> Self {
        self.positions = positions;
        self
    }

    pub fn with_strategy_state(mut self, state: serde_json::Value) -> Self {
        self.strategy_state = Some(state);
        self
    }

    pub fn with_metrics(mut self, metrics: HashMap<String, f64>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Decides when to snapshot, stamps snapshots, enforces retention.
///
/// Explicitly constructed and injected wherever it is needed (task runner,
/// service entry point); there is no process-wide instance.
pub struct CheckpointManager {
    config: CheckpointConfig,
    store: Arc<dyn CheckpointStore>,
}

impl CheckpointManager {
    pub fn new(config: CheckpointConfig, store: Arc<dyn CheckpointStore>) -> Self {
        info!(
            "checkpoint manager: enabled={}, interval={}, max_count={}, warmup={}",
            config.enabled, config.interval, config.max_count, config.warmup_period
        );
        Self { config, store }
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    /// Pure cadence predicate, callable every bar.
    ///
    /// Never saves on bar 0: there is nothing worth resuming before the
    /// first bar has been processed.
    pub fn should_save(&self, bar_index: u64) -> bool {
        if !self.config.enabled || bar_index == 0 {
            return false;
        }
        bar_index % self.config.interval == 0
    }

    /// Stamp and persist one snapshot; trim retention on success.
    ///
    /// Returns `false` when checkpointing is disabled or the store failed.
    /// The caller decides whether to continue without checkpoints.
    pub fn save(
        &self,
        task_id: &str,
        bar_index: u64,
        mut data: CheckpointData,
        strategy_version: Option<&str>,
    ) -> bool {
        if !self.config.enabled {
            return false;
        }

        data.task_id = task_id.to_string();
        data.bar_index = bar_index;
        data.warmup_period = self.config.warmup_period;
        data.strategy_version = strategy_version.map(str::to_string);
        data.format_version = self.config.format_version;
        data.created_at = Some(Utc::now());

        match self.store.append(task_id, &data) {
            Ok(()) => {
                debug!("checkpoint saved: task={task_id}, bar={bar_index}");
                // Best-effort trim; a failure here never fails the save.
                if let Err(e) = self.store.cleanup_old(task_id, self.config.max_count) {
                    warn!("checkpoint retention trim failed for {task_id}: {e}");
                }
                true
            }
            Err(e) => {
                warn!("checkpoint save failed: task={task_id}, bar={bar_index}: {e}");
                false
            }
        }
    }

    /// Latest checkpoint for the task; `Ok(None)` when it has none.
    pub fn load(&self, task_id: &str) -> Result<Option<CheckpointData>, StoreError> {
        let checkpoint = self.store.load_latest(task_id)?;
        if let Some(cp) = &checkpoint {
            info!("checkpoint loaded: task={task_id}, bar={}", cp.bar_index);
        }
        Ok(checkpoint)
    }

    /// All checkpoints for the task, newest first. Diagnostics only.
    pub fn load_all(&self, task_id: &str) -> Result<Vec<CheckpointData>, StoreError> {
        self.store.load_all(task_id)
    }

    /// Bar index to restart replay from after a crash.
    ///
    /// Indicator state implicit in recent bars (moving averages and the
    /// like) cannot be trusted numerically unless the warmup window is
    /// replayed through the live computation path, so the resume point sits
    /// `warmup_period` bars before the checkpoint, floored at zero.
    pub fn get_resume_bar(&self, task_id: &str) -> Result<u64, StoreError> {
        let Some(checkpoint) = self.store.load_latest(task_id)? else {
            return Ok(0);
        };
        let resume_bar = checkpoint.bar_index.saturating_sub(checkpoint.warmup_period);
        info!(
            "resume calculation: task={task_id}, checkpoint_bar={}, warmup={}, resume_bar={resume_bar}",
            checkpoint.bar_index, checkpoint.warmup_period
        );
        Ok(resume_bar)
    }

    /// Delete all checkpoints for a completed task, if the policy says so.
    pub fn cleanup(&self, task_id: &str) -> Result<u64, StoreError> {
        if !self.config.cleanup_on_complete {
            return Ok(0);
        }
        let deleted = self.store.delete(task_id)?;
        info!("checkpoints cleaned up: task={task_id}, deleted={deleted}");
        Ok(deleted)
    }

    /// Whether the task has anything to resume from, without a full load.
    pub fn has_checkpoint(&self, task_id: &str) -> Result<bool, StoreError> {
        Ok(self.store.count(task_id)? > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Minimal in-memory store for the manager's unit tests. The devkit
    /// carries the full-featured stub for integration tests.
    #[derive(Default)]
    struct MemStore {
        tasks: Mutex<HashMap<String, Vec<CheckpointData>>>,
    }

    impl CheckpointStore for MemStore {
        fn append(&self, task_id: &str, checkpoint: &CheckpointData) -> Result<(), StoreError> {
            let mut tasks = self.tasks.lock();
            let records = tasks.entry(task_id.to_string()).or_default();
            records.push(checkpoint.clone());
            records.sort_by_key(|c| c.bar_index);
            Ok(())
        }

        fn load_latest(&self, task_id: &str) -> Result<Option<CheckpointData>, StoreError> {
            Ok(self.tasks.lock().get(task_id).and_then(|r| r.last().cloned()))
        }

        fn load_all(&self, task_id: &str) -> Result<Vec<CheckpointData>, StoreError> {
            let mut records = self.tasks.lock().get(task_id).cloned().unwrap_or_default();
            records.sort_by(|a, b| b.bar_index.cmp(&a.bar_index));
            Ok(records)
        }

        fn delete(&self, task_id: &str) -> Result<u64, StoreError> {
            Ok(self
                .tasks
                .lock()
                .remove(task_id)
                .map(|r| r.len() as u64)
                .unwrap_or(0))
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
            Ok(self.tasks.lock().get(task_id).map(|r| r.len() as u64).unwrap_or(0))
        }
    }

    fn manager(config: CheckpointConfig) -> CheckpointManager {
        CheckpointManager::new(config, Arc::new(MemStore::default()))
    }

    #[test]
    fn cadence_hits_exact_multiples_only() {
        let mgr = manager(CheckpointConfig {
            interval: 10,
            ..CheckpointConfig::default()
        });
        for bar in [10, 20, 30, 100] {
            assert!(mgr.should_save(bar), "bar {bar} should save");
        }
        for bar in [0, 1, 9, 11, 15, 101] {
            assert!(!mgr.should_save(bar), "bar {bar} should not save");
        }
    }

    #[test]
    fn cadence_is_off_when_disabled() {
        let mgr = manager(CheckpointConfig {
            enabled: false,
            interval: 10,
            ..CheckpointConfig::default()
        });
        assert!(!mgr.should_save(10));
        assert!(!mgr.save("task", 10, CheckpointData::new("task", 10), None));
    }

    #[test]
    fn resume_bar_accounts_for_warmup() {
        let mgr = manager(CheckpointConfig {
            warmup_period: 50,
            ..CheckpointConfig::default()
        });
        assert!(mgr.save("task-a", 120, CheckpointData::new("task-a", 120), Some("v1")));
        assert_eq!(mgr.get_resume_bar("task-a").unwrap(), 70);
        // Unknown task starts from scratch.
        assert_eq!(mgr.get_resume_bar("task-unknown").unwrap(), 0);
    }

    #[test]
    fn resume_bar_floors_at_zero() {
        let mgr = manager(CheckpointConfig {
            warmup_period: 50,
            interval: 10,
            ..CheckpointConfig::default()
        });
        assert!(mgr.save("task-b", 30, CheckpointData::new("task-b", 30), None));
        assert_eq!(mgr.get_resume_bar("task-b").unwrap(), 0);
    }

    #[test]
    fn save_stamps_metadata() {
        let mgr = manager(CheckpointConfig {
            warmup_period: 25,
            format_version: 3,
            ..CheckpointConfig::default()
        });
        assert!(mgr.save("task-c", 50, CheckpointData::new("ignored", 0), Some("sha-abc")));
        let cp = mgr.load("task-c").unwrap().unwrap();
        assert_eq!(cp.task_id, "task-c");
        assert_eq!(cp.bar_index, 50);
        assert_eq!(cp.warmup_period, 25);
        assert_eq!(cp.format_version, 3);
        assert_eq!(cp.strategy_version.as_deref(), Some("sha-abc"));
        assert!(cp.created_at.is_some());
    }

    #[test]
    fn retention_keeps_newest() {
        let mgr = manager(CheckpointConfig {
            interval: 10,
            max_count: 5,
            ..CheckpointConfig::default()
        });
        for bar in [10, 20, 30, 40, 50, 60] {
            assert!(mgr.save("task-d", bar, CheckpointData::new("task-d", bar), None));
        }
        let all = mgr.load_all("task-d").unwrap();
        let bars: Vec<u64> = all.iter().map(|c| c.bar_index).collect();
        assert_eq!(bars, vec![60, 50, 40, 30, 20]);
        assert_eq!(mgr.load("task-d").unwrap().unwrap().bar_index, 60);
    }

    #[test]
    fn cleanup_honors_policy() {
        let keep = manager(CheckpointConfig {
            cleanup_on_complete: false,
            ..CheckpointConfig::default()
        });
        assert!(keep.save("task-e", 50, CheckpointData::new("task-e", 50), None));
        assert_eq!(keep.cleanup("task-e").unwrap(), 0);
        assert!(keep.has_checkpoint("task-e").unwrap());

        let purge = manager(CheckpointConfig::default());
        assert!(purge.save("task-f", 50, CheckpointData::new("task-f", 50), None));
        assert!(purge.save("task-f", 100, CheckpointData::new("task-f", 100), None));
        assert_eq!(purge.cleanup("task-f").unwrap(), 2);
        assert!(!purge.has_checkpoint("task-f").unwrap());
    }
}
