//! Strategy seam for the reference runner.
//!
//! Strategies are compiled implementations selected by name from a
//! registry, never loaded from source text at runtime. A strategy sees one
//! bar at a time and answers with an action; its indicator state can be
//! snapshotted into a checkpoint and restored from one.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

/// One discrete time-step of market data.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// What the strategy wants done at this bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Hold,
    EnterLong,
    ExitLong,
}

/// Per-bar view handed to the strategy.
#[derive(Debug, Clone, Copy)]
pub struct BarContext<'a> {
    pub bar_index: u64,
    pub bar: &'a Bar,
    /// Current position size in units; 0.0 when flat.
    pub position_size: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum StrategyError {
    #[error("unknown strategy: {0:?}")]
    Unknown(String),
    #[error("invalid strategy state: {0}")]
    InvalidState(String),
    #[error("invalid strategy parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },
}

/// Capability interface every compiled strategy satisfies.
pub trait Strategy: Send {
    fn name(&self) -> &'static str;

    /// Version tag stamped into checkpoints so a resume can detect that the
    /// strategy changed underneath its saved state.
    fn version(&self) -> &'static str;

    fn on_bar(&mut self, ctx: &BarContext<'_>) -> Action;

    /// Indicator state for checkpointing.
    fn snapshot(&self) -> serde_json::Value;

    /// Restore indicator state from a checkpoint snapshot. Only trusted
    /// when the resume point needs no warmup replay.
    fn restore(&mut self, state: &serde_json::Value) -> Result<(), StrategyError>;
}

type StrategyFactory =
    Box<dyn Fn(&HashMap<String, String>) -> Result<Box<dyn Strategy>, StrategyError> + Send + Sync>;

/// Named registry of compiled strategies, chosen by configuration.
pub struct StrategyRegistry {
    factories: HashMap<String, StrategyFactory>,
}

impl StrategyRegistry {
    /// Registry with the built-in strategies.
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("sma-cross", |params| {
            let fast = parse_period(params, "fast", 10)?;
            let slow = parse_period(params, "slow", 30)?;
            Ok(Box::new(SmaCross::new(fast, slow)?))
        });
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&HashMap<String, String>) -> Result<Box<dyn Strategy>, StrategyError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Instantiate a strategy by name; unknown names are a contract error.
    pub fn create(
        &self,
        name: &str,
        params: &HashMap<String, String>,
    ) -> Result<Box<dyn Strategy>, StrategyError> {
        match self.factories.get(name) {
            Some(factory) => factory(params),
            None => Err(StrategyError::Unknown(name.to_string())),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_period(
    params: &HashMap<String, String>,
    name: &str,
    default: usize,
) -> Result<usize, StrategyError> {
    match params.get(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<usize>()
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| StrategyError::InvalidParameter {
                name: name.to_string(),
                reason: format!("expected positive integer, got {raw:?}"),
            }),
    }
}

/// Rolling arithmetic mean over a fixed window.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RollingMean {
    period: usize,
    window: VecDeque<f64>,
    sum: f64,
}

impl RollingMean {
    fn new(period: usize) -> Self {
        Self {
            period,
            window: VecDeque::with_capacity(period),
            sum: 0.0,
        }
    }

    fn push(&mut self, value: f64) -> Option<f64> {
        self.window.push_back(value);
        self.sum += value;
        if self.window.len() > self.period {
            if let Some(dropped) = self.window.pop_front() {
                self.sum -= dropped;
            }
        }
        if self.window.len() == self.period {
            Some(self.sum / self.period as f64)
        } else {
            None
        }
    }
}

/// Serialized SmaCross indicator state.
#[derive(Debug, Serialize, Deserialize)]
struct SmaCrossState {
    fast: RollingMean,
    slow: RollingMean,
}

/// Moving-average crossover: long while the fast mean is above the slow
/// one. Stateful rolling windows make this the canonical case for warmup
/// replay after a resume.
pub struct SmaCross {
    fast: RollingMean,
    slow: RollingMean,
}

impl SmaCross {
    pub fn new(fast_period: usize, slow_period: usize) -> Result<Self, StrategyError> {
        if fast_period >= slow_period {
            return Err(StrategyError::InvalidParameter {
                name: "fast".to_string(),
                reason: format!("fast period {fast_period} must be below slow period {slow_period}"),
            });
        }
        Ok(Self {
            fast: RollingMean::new(fast_period),
            slow: RollingMean::new(slow_period),
        })
    }
}

impl Strategy for SmaCross {
    fn name(&self) -> &'static str {
        "sma-cross"
    }

    fn version(&self) -> &'static str {
        "sma-cross/1"
    }

    fn on_bar(&mut self, ctx: &BarContext<'_>) -> Action {
        let fast = self.fast.push(ctx.bar.close);
        let slow = self.slow.push(ctx.bar.close);
        let (Some(fast), Some(slow)) = (fast, slow) else {
            return Action::Hold;
        };

        if fast > slow && ctx.position_size == 0.0 {
            Action::EnterLong
        } else if fast < slow && ctx.position_size > 0.0 {
            Action::ExitLong
        } else {
            Action::Hold
        }
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(SmaCrossState {
            fast: self.fast.clone(),
            slow: self.slow.clone(),
        })
        .unwrap_or(serde_json::Value::Null)
    }

    fn restore(&mut self, state: &serde_json::Value) -> Result<(), StrategyError> {
        let state: SmaCrossState = serde_json::from_value(state.clone())
            .map_err(|e| StrategyError::InvalidState(e.to_string()))?;
        if state.fast.period != self.fast.period || state.slow.period != self.slow.period {
            return Err(StrategyError::InvalidState(format!(
                "snapshot periods {}/{} do not match configured {}/{}",
                state.fast.period, state.slow.period, self.fast.period, self.slow.period
            )));
        }
        self.fast = state.fast;
        self.slow = state.slow;
        Ok(())
    }
}
