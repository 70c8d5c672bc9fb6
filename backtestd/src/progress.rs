//! Backtest progress tracking.
//!
//! Callback-based: the embedding surface (task server, tests) subscribes to
//! `ProgressUpdate`s instead of polling. Phases form a fixed set; parsing an
//! unknown phase name is a validation error, not a silent fallback.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

/// Fixed set of backtest workflow phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Initializing,
    LoadingData,
    PreparingStrategies,
    RunningBacktest,
    StoringResults,
    Completed,
    Failed,
}

impl ProgressPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::LoadingData => "loading_data",
            Self::PreparingStrategies => "preparing_strategies",
            Self::RunningBacktest => "running_backtest",
            Self::StoringResults => "storing_results",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ProgressPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown phase name where one of the fixed set was expected.
#[derive(Debug, thiserror::Error)]
#[error("unknown progress phase: {0:?}")]
pub struct UnknownPhase(pub String);

impl FromStr for ProgressPhase {
    type Err = UnknownPhase;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(Self::Initializing),
            "loading_data" => Ok(Self::LoadingData),
            "preparing_strategies" => Ok(Self::PreparingStrategies),
            "running_backtest" => Ok(Self::RunningBacktest),
            "storing_results" => Ok(Self::StoringResults),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownPhase(other.to_string())),
        }
    }
}

/// One progress notification.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressUpdate {
    pub task_id: String,
    pub phase: ProgressPhase,
    pub current: u64,
    pub total: u64,
    pub percentage: f64,
    pub message: String,
}

/// Subscriber callback; errors are logged, never propagated into the run.
pub type ProgressCallback = Box<dyn Fn(&ProgressUpdate) -> anyhow::Result<()> + Send + Sync>;

/// Tracks one task's progress and notifies the subscriber on every change.
pub struct ProgressTracker {
    task_id: String,
    callback: Option<ProgressCallback>,
    phase: ProgressPhase,
    total_bars: u64,
    processed_bars: u64,
    message: String,
}

impl ProgressTracker {
    pub fn new(task_id: &str, callback: Option<ProgressCallback>) -> Self {
        debug!("progress tracker initialized for task {task_id}");
        Self {
            task_id: task_id.to_string(),
            callback,
            phase: ProgressPhase::Initializing,
            total_bars: 0,
            processed_bars: 0,
            message: String::new(),
        }
    }

    pub fn phase(&self) -> ProgressPhase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: ProgressPhase, message: &str) {
        self.phase = phase;
        self.message = message.to_string();
        info!("task {}: {} - {}", self.task_id, phase, message);
        self.notify();
    }

    pub fn set_total_bars(&mut self, total: u64) {
        self.total_bars = total;
        self.processed_bars = 0;
        self.notify();
    }

    pub fn update_bars_processed(&mut self, processed: u64) {
        self.processed_bars = processed.min(self.total_bars);
        self.notify();
    }

    pub fn increment_processed(&mut self, count: u64) {
        self.update_bars_processed(self.processed_bars + count);
    }

    pub fn set_completed(&mut self, message: &str) {
        self.processed_bars = self.total_bars;
        self.set_phase(ProgressPhase::Completed, message);
    }

    pub fn set_failed(&mut self, error_message: &str) {
        self.phase = ProgressPhase::Failed;
        self.message = error_message.to_string();
        error!("task {}: failed - {error_message}", self.task_id);
        self.notify();
    }

    pub fn percentage(&self) -> f64 {
        if self.total_bars == 0 {
            return 0.0;
        }
        (self.processed_bars as f64 / self.total_bars as f64) * 100.0
    }

    fn notify(&self) {
        let Some(callback) = &self.callback else {
            return;
        };
        let update = ProgressUpdate {
            task_id: self.task_id.clone(),
            phase: self.phase,
            current: self.processed_bars,
            total: self.total_bars,
            percentage: self.percentage(),
            message: self.message.clone(),
        };
        if let Err(e) = callback(&update) {
            error!("progress callback error for task {}: {e:#}", self.task_id);
        }
    }
}
