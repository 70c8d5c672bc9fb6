//! backtestd - Backtest execution plugin for the Core orchestrator
//!
//! A long-running worker that registers with the Core, reports liveness,
//! accepts remote commands, and keeps long backtests resumable:
//! - `lifecycle`: registration, heartbeat, reconnection, command dispatch
//! - `checkpoint`: periodic snapshots and warmup-aware resume
//! - `supervisor`: the Core link (protocol types, trait, MQTT transport)
//! - `runner` / `strategy`: reference bar loop over compiled strategies
//! - `progress` / `metrics` / `config`: supporting services

pub mod checkpoint;
pub mod config;
pub mod lifecycle;
pub mod metrics;
pub mod progress;
pub mod runner;
pub mod strategy;
pub mod supervisor;
