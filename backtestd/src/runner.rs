//! Reference backtest runner.
//!
//! Drives the bar-by-bar loop and wires the seams together: strategy
//! registry in, checkpoint manager at bar boundaries, task accounting and
//! progress reporting out. Resume semantics:
//! - broker and position state come straight from the checkpoint (exact)
//! - indicator state is rebuilt by replaying the warmup window through the
//!   live strategy path with order execution suppressed
//! - only a zero-warmup policy trusts the checkpointed strategy snapshot

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::checkpoint::store::StoreError;
use crate::checkpoint::{
    BrokerState, CheckpointData, CheckpointKind, CheckpointManager, PositionState,
};
use crate::lifecycle::LifecycleManager;
use crate::progress::{ProgressCallback, ProgressPhase, ProgressTracker};
use crate::strategy::{Action, Bar, BarContext, Strategy, StrategyError, StrategyRegistry};
use crate::supervisor::SupervisorClient;

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("invalid run settings: {0}")]
    InvalidSettings(String),
    #[error("no market data supplied")]
    NoData,
    #[error("task {task_id} cancelled")]
    Cancelled { task_id: String },
    #[error("unusable checkpoint: {0}")]
    InvalidCheckpoint(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Strategy(#[from] StrategyError),
}

/// Execution parameters for a run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub initial_capital: f64,
    /// Cash committed per entry.
    pub order_size_cash: f64,
    /// Commission per trade, as a fraction (0.001 = 0.1%).
    pub commission_rate: f64,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            initial_capital: 100_000.0,
            order_size_cash: 1_000.0,
            commission_rate: 0.001,
        }
    }
}

impl RunSettings {
    fn validate(&self) -> Result<(), RunnerError> {
        if self.initial_capital <= 0.0 {
            return Err(RunnerError::InvalidSettings(format!(
                "initial_capital must be positive, got {}",
                self.initial_capital
            )));
        }
        if self.order_size_cash <= 0.0 {
            return Err(RunnerError::InvalidSettings(format!(
                "order_size_cash must be positive, got {}",
                self.order_size_cash
            )));
        }
        if !(0.0..1.0).contains(&self.commission_rate) {
            return Err(RunnerError::InvalidSettings(format!(
                "commission_rate must be in [0, 1), got {}",
                self.commission_rate
            )));
        }
        Ok(())
    }
}

/// Result of one completed run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub task_id: String,
    /// Bars traded live (warmup replay excluded).
    pub bars_processed: u64,
    pub final_value: f64,
    pub round_trips: u32,
    /// Checkpoint bar the run resumed from, if it did.
    pub resumed_from_bar: Option<u64>,
}

/// Cancellation flags for the tasks currently in flight.
#[derive(Clone, Default)]
pub struct TaskTable {
    inner: Arc<Mutex<HashMap<String, Arc<AtomicBool>>>>,
}

impl TaskTable {
    pub fn register(&self, task_id: &str) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.inner.lock().insert(task_id.to_string(), flag.clone());
        flag
    }

    fn finish(&self, task_id: &str) {
        self.inner.lock().remove(task_id);
    }

    /// Cancel one task; false when it is not running.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.inner.lock().get(task_id) {
            Some(flag) => {
                flag.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Cancel everything in flight; returns how many tasks were flagged.
    pub fn cancel_all(&self) -> usize {
        let table = self.inner.lock();
        for flag in table.values() {
            flag.store(true, Ordering::Relaxed);
        }
        table.len()
    }

    pub fn active_tasks(&self) -> Vec<String> {
        self.inner.lock().keys().cloned().collect()
    }
}

/// Runs backtest tasks against the checkpoint manager and the lifecycle
/// task accounting. All collaborators are injected.
pub struct BacktestRunner<C: SupervisorClient + 'static> {
    lifecycle: LifecycleManager<C>,
    checkpoints: Arc<CheckpointManager>,
    registry: StrategyRegistry,
    tasks: TaskTable,
    settings: RunSettings,
}

impl<C: SupervisorClient + 'static> BacktestRunner<C> {
    pub fn new(
        lifecycle: LifecycleManager<C>,
        checkpoints: Arc<CheckpointManager>,
        registry: StrategyRegistry,
        tasks: TaskTable,
        settings: RunSettings,
    ) -> Self {
        Self {
            lifecycle,
            checkpoints,
            registry,
            tasks,
            settings,
        }
    }

    pub fn tasks(&self) -> &TaskTable {
        &self.tasks
    }

    /// Execute one task to completion, resuming from the latest checkpoint
    /// when one exists.
    pub fn run(
        &self,
        task_id: &str,
        symbol: &str,
        bars: &[Bar],
        strategy_name: &str,
        strategy_params: &HashMap<String, String>,
        progress_callback: Option<ProgressCallback>,
    ) -> Result<RunOutcome, RunnerError> {
        // Contract checks happen before the task counts as started.
        self.settings.validate()?;
        if bars.is_empty() {
            return Err(RunnerError::NoData);
        }
        let mut strategy = self.registry.create(strategy_name, strategy_params)?;

        let cancel = self.tasks.register(task_id);
        self.lifecycle.task_started();
        let mut progress = ProgressTracker::new(task_id, progress_callback);

        let result = self.execute(task_id, symbol, bars, strategy.as_mut(), &mut progress, &cancel);
        self.tasks.finish(task_id);

        match &result {
            Ok(outcome) => {
                progress.set_completed(&format!(
                    "backtest completed: final value {:.2}",
                    outcome.final_value
                ));
                self.lifecycle.task_completed();
            }
            Err(e) => {
                progress.set_failed(&e.to_string());
                self.lifecycle.task_failed(&e.to_string());
            }
        }
        result
    }

    fn execute(
        &self,
        task_id: &str,
        symbol: &str,
        bars: &[Bar],
        strategy: &mut dyn Strategy,
        progress: &mut ProgressTracker,
        cancel: &AtomicBool,
    ) -> Result<RunOutcome, RunnerError> {
        progress.set_phase(ProgressPhase::Initializing, "preparing backtest");
        progress.set_total_bars(bars.len() as u64);

        let mut broker = Broker::new(&self.settings);
        let mut start_bar: u64 = 0;
        // Bars below this index only rebuild indicator state.
        let mut live_from: u64 = 0;
        let mut resumed_from_bar = None;

        if self.checkpoints.has_checkpoint(task_id)? {
            if let Some(checkpoint) = self.checkpoints.load(task_id)? {
                let stale_version = checkpoint
                    .strategy_version
                    .as_deref()
                    .is_some_and(|v| v != strategy.version());
                if stale_version {
                    warn!(
                        "checkpoint for task {task_id} was written by {:?}, current strategy is {:?}; starting cold",
                        checkpoint.strategy_version, strategy.version()
                    );
                } else {
                    if checkpoint.bar_index as usize >= bars.len() {
                        return Err(RunnerError::InvalidCheckpoint(format!(
                            "checkpoint bar {} beyond supplied data ({} bars)",
                            checkpoint.bar_index,
                            bars.len()
                        )));
                    }
                    broker.restore(&checkpoint)?;
                    let resume_bar = self.checkpoints.get_resume_bar(task_id)?;
                    if resume_bar >= checkpoint.bar_index {
                        // No warmup window configured: the snapshot is trusted.
                        if let Some(state) = &checkpoint.strategy_state {
                            strategy.restore(state)?;
                        }
                        start_bar = checkpoint.bar_index + 1;
                    } else {
                        start_bar = resume_bar;
                    }
                    live_from = checkpoint.bar_index + 1;
                    resumed_from_bar = Some(checkpoint.bar_index);
                    info!(
                        "resuming task {task_id}: checkpoint_bar={}, replay_from={start_bar}, live_from={live_from}",
                        checkpoint.bar_index
                    );
                }
            }
        }

        progress.set_phase(
            ProgressPhase::RunningBacktest,
            &format!("running {} on {symbol}", strategy.name()),
        );
        progress.update_bars_processed(start_bar);

        let mut live_bars: u64 = 0;
        for (i, bar) in bars.iter().enumerate().skip(start_bar as usize) {
            let bar_index = i as u64;
            if cancel.load(Ordering::Relaxed) {
                warn!("task {task_id} cancelled at bar {bar_index}");
                return Err(RunnerError::Cancelled {
                    task_id: task_id.to_string(),
                });
            }

            let action = strategy.on_bar(&BarContext {
                bar_index,
                bar,
                position_size: broker.position_size(),
            });

            if bar_index < live_from {
                // Warmup replay: indicators only, no order execution.
                continue;
            }

            broker.apply(action, bar.close);
            broker.mark(bar.close);
            live_bars += 1;

            if self.checkpoints.should_save(bar_index) {
                let data = CheckpointData::new(task_id, bar_index)
                    .with_broker(broker.state())
                    .with_positions(broker.positions(symbol))
                    .with_strategy_state(strategy.snapshot())
                    .with_metrics(broker.metrics());
                // A failed save is logged by the manager; the run goes on
                // without checkpoint coverage for this bar.
                self.checkpoints
                    .save(task_id, bar_index, data, Some(strategy.version()));
            }
            progress.update_bars_processed(bar_index + 1);
        }

        progress.set_phase(ProgressPhase::StoringResults, "finalizing results");
        let policy = self.checkpoints.config();
        if policy.enabled && !policy.cleanup_on_complete {
            // The task's checkpoints outlive it; leave a terminal snapshot
            // marking the run as finished.
            let last_bar = (bars.len() - 1) as u64;
            let data = CheckpointData::new(task_id, last_bar)
                .with_kind(CheckpointKind::Final)
                .with_broker(broker.state())
                .with_positions(broker.positions(symbol))
                .with_strategy_state(strategy.snapshot())
                .with_metrics(broker.metrics());
            self.checkpoints
                .save(task_id, last_bar, data, Some(strategy.version()));
        }
        if let Err(e) = self.checkpoints.cleanup(task_id) {
            warn!("checkpoint cleanup failed for {task_id}: {e}");
        }

        Ok(RunOutcome {
            task_id: task_id.to_string(),
            bars_processed: live_bars,
            final_value: broker.value(),
            round_trips: broker.round_trips(),
            resumed_from_bar,
        })
    }
}

/// Single-symbol cash account with per-trade commission.
struct Broker {
    cash: f64,
    value: f64,
    commission_paid: f64,
    position_size: f64,
    entry_price: f64,
    round_trips: u32,
    order_size_cash: f64,
    commission_rate: f64,
}

impl Broker {
    fn new(settings: &RunSettings) -> Self {
        Self {
            cash: settings.initial_capital,
            value: settings.initial_capital,
            commission_paid: 0.0,
            position_size: 0.0,
            entry_price: 0.0,
            round_trips: 0,
            order_size_cash: settings.order_size_cash,
            commission_rate: settings.commission_rate,
        }
    }

    fn apply(&mut self, action: Action, price: f64) {
        match action {
            Action::EnterLong if self.position_size == 0.0 => {
                let fee = self.order_size_cash * self.commission_rate;
                if self.cash < self.order_size_cash + fee {
                    warn!("entry skipped: insufficient cash ({:.2})", self.cash);
                    return;
                }
                self.cash -= self.order_size_cash + fee;
                self.commission_paid += fee;
                self.position_size = self.order_size_cash / price;
                self.entry_price = price;
            }
            Action::ExitLong if self.position_size > 0.0 => {
                let proceeds = self.position_size * price;
                let fee = proceeds * self.commission_rate;
                self.cash += proceeds - fee;
                self.commission_paid += fee;
                self.position_size = 0.0;
                self.entry_price = 0.0;
                self.round_trips += 1;
            }
            _ => {}
        }
    }

    fn mark(&mut self, price: f64) {
        self.value = self.cash + self.position_size * price;
    }

    fn value(&self) -> f64 {
        self.value
    }

    fn position_size(&self) -> f64 {
        self.position_size
    }

    fn round_trips(&self) -> u32 {
        self.round_trips
    }

    fn state(&self) -> BrokerState {
        BrokerState {
            cash: self.cash,
            value: self.value,
            commission_paid: self.commission_paid,
        }
    }

    fn positions(&self, symbol: &str) -> Vec<PositionState> {
        if self.position_size > 0.0 {
            vec![PositionState {
                symbol: symbol.to_string(),
                size: self.position_size,
                price: self.entry_price,
            }]
        } else {
            Vec::new()
        }
    }

    fn metrics(&self) -> HashMap<String, f64> {
        HashMap::from([
            ("value".to_string(), self.value),
            ("cash".to_string(), self.cash),
            ("round_trips".to_string(), self.round_trips as f64),
        ])
    }

    fn restore(&mut self, checkpoint: &CheckpointData) -> Result<(), RunnerError> {
        let broker = checkpoint.broker.as_ref().ok_or_else(|| {
            RunnerError::InvalidCheckpoint("checkpoint carries no broker state".to_string())
        })?;
        self.cash = broker.cash;
        self.value = broker.value;
        self.commission_paid = broker.commission_paid;
        match checkpoint.positions.first() {
            Some(position) => {
                self.position_size = position.size;
                self.entry_price = position.price;
            }
            None => {
                self.position_size = 0.0;
                self.entry_price = 0.0;
            }
        }
        if let Some(metrics) = &checkpoint.metrics {
            if let Some(round_trips) = metrics.get("round_trips") {
                self.round_trips = *round_trips as u32;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_round_trip_accounting() {
        let settings = RunSettings {
            initial_capital: 10_000.0,
            order_size_cash: 1_000.0,
            commission_rate: 0.001,
        };
        let mut broker = Broker::new(&settings);

        broker.apply(Action::EnterLong, 10.0);
        broker.mark(10.0);
        assert_eq!(broker.position_size(), 100.0);
        // Entry costs the order size plus its fee; value only reflects the fee.
        assert!((broker.value() - 9_999.0).abs() < 1e-9);

        broker.apply(Action::ExitLong, 12.0);
        broker.mark(12.0);
        assert_eq!(broker.round_trips(), 1);
        assert_eq!(broker.position_size(), 0.0);
        // 200 gross profit minus 1.0 entry fee and 1.2 exit fee.
        assert!((broker.value() - 10_197.8).abs() < 1e-9);
    }

    #[test]
    fn broker_ignores_redundant_actions() {
        let mut broker = Broker::new(&RunSettings::default());
        broker.apply(Action::ExitLong, 10.0);
        assert_eq!(broker.round_trips(), 0);
        broker.apply(Action::EnterLong, 10.0);
        let size = broker.position_size();
        broker.apply(Action::EnterLong, 11.0);
        assert_eq!(broker.position_size(), size);
    }

    #[test]
    fn settings_validation() {
        assert!(RunSettings::default().validate().is_ok());
        assert!(RunSettings {
            initial_capital: 0.0,
            ..RunSettings::default()
        }
        .validate()
        .is_err());
        assert!(RunSettings {
            commission_rate: 1.0,
            ..RunSettings::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn task_table_cancel_all() {
        let table = TaskTable::default();
        let a = table.register("task-a");
        let b = table.register("task-b");
        assert_eq!(table.active_tasks().len(), 2);
        assert_eq!(table.cancel_all(), 2);
        assert!(a.load(Ordering::Relaxed));
        assert!(b.load(Ordering::Relaxed));
        table.finish("task-a");
        assert!(!table.cancel("task-a"));
    }
}
