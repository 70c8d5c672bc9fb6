//! backtestd - plugin process entry point
//!
//! Builds the checkpoint store, the Core link and the lifecycle manager,
//! starts the lifecycle, and blocks until a termination signal arrives or
//! the Core sends `shutdown`. Task submission rides on the callback surface
//! advertised at registration and is wired by the embedding deployment.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use backtestd::checkpoint::store::JsonFileStore;
use backtestd::checkpoint::CheckpointManager;
use backtestd::config::PluginSettings;
use backtestd::lifecycle::LifecycleManager;
use backtestd::runner::{BacktestRunner, RunSettings, TaskTable};
use backtestd::strategy::StrategyRegistry;
use backtestd::supervisor::mqtt::MqttSupervisorClient;

/// Backtest engine plugin.
#[derive(Debug, Parser)]
#[command(name = "backtestd", version, about)]
struct Args {
    /// Callback port advertised to the Core.
    #[arg(long)]
    port: Option<u16>,

    /// Core broker address for registration (e.g. localhost:1883).
    /// Omit to run standalone.
    #[arg(long)]
    core_address: Option<String>,

    /// Settings file (default: $BACKTESTD_CONFIG or ./backtestd.toml).
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "backtestd=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut settings = PluginSettings::load(args.config.as_deref())
        .await
        .context("load settings")?;
    if let Some(port) = args.port {
        settings.listen.port = port;
    }
    if let Some(address) = args.core_address {
        settings.core.address = Some(address);
    }

    info!(
        "starting backtestd plugin: id={}, version={}, port={}",
        settings.plugin.id, settings.plugin.version, settings.listen.port
    );

    let store =
        JsonFileStore::new(&settings.checkpoint.data_dir).context("open checkpoint store")?;
    let checkpoints = Arc::new(CheckpointManager::new(
        settings.checkpoint.policy.clone(),
        Arc::new(store),
    ));

    let client = match &settings.core.address {
        Some(address) => Some(Arc::new(
            MqttSupervisorClient::connect(
                address,
                &settings.plugin.id,
                Duration::from_millis(settings.core.request_timeout_ms),
            )
            .context("open core link")?,
        )),
        None => {
            info!("no core address configured, running standalone");
            None
        }
    };

    let lifecycle = LifecycleManager::new(
        settings.plugin.clone(),
        settings.core.clone(),
        settings.listen.port,
        client,
    );

    // The runner is handed to the task-submission surface; its task table
    // backs the cancel_all command from the Core.
    let tasks = TaskTable::default();
    let _runner = Arc::new(BacktestRunner::new(
        lifecycle.clone(),
        checkpoints.clone(),
        StrategyRegistry::new(),
        tasks.clone(),
        RunSettings::default(),
    ));
    {
        let tasks = tasks.clone();
        lifecycle.register_command_handler("cancel_all", move |_params| {
            let cancelled = tasks.cancel_all();
            info!("cancel_all: flagged {cancelled} active tasks");
            Ok(())
        });
    }

    lifecycle.start().await;

    wait_for_termination(&lifecycle).await;

    lifecycle.stop().await;
    info!("backtestd plugin stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_termination(
    lifecycle: &LifecycleManager<MqttSupervisorClient>,
) {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("cannot install SIGTERM handler: {e}");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received interrupt signal"),
                _ = lifecycle.wait_until_stopped() => info!("shutdown requested"),
            }
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received interrupt signal"),
        _ = sigterm.recv() => info!("received terminate signal"),
        _ = lifecycle.wait_until_stopped() => info!("shutdown requested"),
    }
}

#[cfg(not(unix))]
async fn wait_for_termination(
    lifecycle: &LifecycleManager<MqttSupervisorClient>,
) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received interrupt signal"),
        _ = lifecycle.wait_until_stopped() => info!("shutdown requested"),
    }
}
