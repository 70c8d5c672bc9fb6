//! Plugin lifecycle management.
//!
//! Owns the plugin's externally visible state and everything on the Core
//! link:
//! - registration on startup, standalone fallback when the Core is away
//! - periodic heartbeat with status reporting on a dedicated task
//! - bounded reconnection after link loss
//! - command processing (pause/resume/shutdown/reload + custom handlers)
//! - task accounting driving the Ready/Busy transitions

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{CoreLinkSettings, PluginIdentity};
use crate::metrics::ResourceSampler;
use crate::supervisor::{
    CoreCommand, HeartbeatRequest, RegisterRequest, StatusReport, SupervisorClient,
    UnregisterRequest,
};

/// Plugin execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginState {
    Starting,
    Ready,
    Busy,
    Paused,
    Error,
    Stopping,
}

impl PluginState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::Stopping => "stopping",
        }
    }
}

/// Plugin runtime metrics, rebuilt on every read.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PluginMetrics {
    pub uptime_seconds: u64,
    pub active_tasks: u32,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    pub last_error: Option<String>,
}

type CommandHandler = Arc<dyn Fn(&HashMap<String, String>) -> anyhow::Result<()> + Send + Sync>;

/// Registration handed out by the Core; void again after unregister or a
/// failed heartbeat.
struct Session {
    id: String,
    heartbeat_interval: Duration,
}

/// The one mutable record. Counter and state changes happen together under
/// this lock so task accounting stays linearizable; no RPC ever runs while
/// it is held.
struct Inner {
    state: PluginState,
    running: bool,
    active_tasks: u32,
    completed_tasks: u64,
    failed_tasks: u64,
    last_error: Option<String>,
    session: Option<Session>,
    reconnect_attempts: u32,
    link_lost: bool,
}

/// How a heartbeat cycle ended, deciding the next sleep.
enum CycleOutcome {
    Normal,
    LinkDown,
}

enum HeartbeatOutcome {
    Acked,
    NotAcked,
    Failed,
}

/// Lifecycle manager for the plugin process.
///
/// Cheap to clone; clones share all state. The supervisor connection is
/// owned exclusively by this component.
pub struct LifecycleManager<C: SupervisorClient + 'static> {
    identity: PluginIdentity,
    link: CoreLinkSettings,
    callback_address: String,
    client: Option<Arc<C>>,
    inner: Arc<Mutex<Inner>>,
    handlers: Arc<Mutex<HashMap<String, CommandHandler>>>,
    sampler: Arc<ResourceSampler>,
    started_at: Instant,
    shutdown_tx: Arc<watch::Sender<bool>>,
    heartbeat_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl<C: SupervisorClient + 'static> Clone for LifecycleManager<C> {
    fn clone(&self) -> Self {
        Self {
            identity: self.identity.clone(),
            link: self.link.clone(),
            callback_address: self.callback_address.clone(),
            client: self.client.clone(),
            inner: self.inner.clone(),
            handlers: self.handlers.clone(),
            sampler: self.sampler.clone(),
            started_at: self.started_at,
            shutdown_tx: self.shutdown_tx.clone(),
            heartbeat_task: self.heartbeat_task.clone(),
        }
    }
}

impl<C: SupervisorClient + 'static> LifecycleManager<C> {
    /// `client = None` runs the plugin standalone from the start.
    pub fn new(
        identity: PluginIdentity,
        link: CoreLinkSettings,
        listen_port: u16,
        client: Option<Arc<C>>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        info!("lifecycle manager initialized: plugin_id={}", identity.id);
        Self {
            callback_address: format!("localhost:{listen_port}"),
            identity,
            link,
            client,
            inner: Arc::new(Mutex::new(Inner {
                state: PluginState::Starting,
                running: false,
                active_tasks: 0,
                completed_tasks: 0,
                failed_tasks: 0,
                last_error: None,
                session: None,
                reconnect_attempts: 0,
                link_lost: false,
            })),
            handlers: Arc::new(Mutex::new(HashMap::new())),
            sampler: Arc::new(ResourceSampler::new()),
            started_at: Instant::now(),
            shutdown_tx: Arc::new(shutdown_tx),
            heartbeat_task: Arc::new(Mutex::new(None)),
        }
    }

    // ======================================================================
    // Lifecycle
    // ======================================================================

    /// Connect, register and start the heartbeat; falls back to standalone
    /// operation when the Core is unreachable or rejects us. Returns false
    /// if already running.
    pub async fn start(&self) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.running {
                warn!("lifecycle manager already running");
                return false;
            }
            inner.running = true;
        }

        if let Some(client) = self.client.clone() {
            let timeout = Duration::from_millis(self.link.connect_timeout_ms);
            if client.wait_ready(timeout).await {
                if self.register().await {
                    self.spawn_heartbeat();
                }
            } else {
                warn!("timeout waiting for core connection, running standalone");
            }
        }

        self.inner.lock().state = PluginState::Ready;
        info!("lifecycle manager started");
        true
    }

    /// Stop the heartbeat, unregister, close down. Idempotent, and safe to
    /// call even if `start()` never connected.
    pub async fn stop(&self) {
        info!("stopping lifecycle manager");
        {
            let mut inner = self.inner.lock();
            inner.state = PluginState::Stopping;
            inner.running = false;
        }
        let _ = self.shutdown_tx.send(true);

        let handle = self.heartbeat_task.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(Duration::from_secs(5), &mut handle)
                .await
                .is_err()
            {
                warn!("heartbeat task did not stop within join timeout, aborting");
                handle.abort();
            }
        }

        let session_id = self.session_id();
        if let (Some(client), Some(session_id)) = (self.client.clone(), session_id) {
            let request = UnregisterRequest {
                plugin_id: self.identity.id.clone(),
                session_id,
                reason: "shutdown".to_string(),
            };
            match client.unregister(request).await {
                Ok(ack) if ack.success => {
                    self.clear_session();
                    info!("unregistered from core");
                }
                Ok(ack) => warn!(
                    "unregister rejected: {}",
                    ack.error.unwrap_or_else(|| "unspecified".to_string())
                ),
                Err(e) => warn!("unregister call failed: {e}"),
            }
        }

        info!("lifecycle manager stopped");
    }

    /// Resolves once `stop()` ran or a `shutdown` command cleared the
    /// running flag.
    pub async fn wait_until_stopped(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            if !self.is_running() {
                return;
            }
            if shutdown_rx.changed().await.is_err() {
                return;
            }
        }
    }

    // ======================================================================
    // Registration & reconnection
    // ======================================================================

    async fn register(&self) -> bool {
        let Some(client) = self.client.clone() else {
            return false;
        };

        info!("registering with core");
        let request = RegisterRequest {
            plugin_id: self.identity.id.clone(),
            name: self.identity.name.clone(),
            version: self.identity.version.clone(),
            description: self.identity.description.clone(),
            plugin_type: self.identity.plugin_type.clone(),
            capabilities: self.identity.capabilities.clone(),
            callback_address: self.callback_address.clone(),
        };

        match client.register(request).await {
            Ok(ack) if ack.success => {
                // The Core dictates the cadence; our configured value is
                // only the fallback until it does.
                let interval = if ack.heartbeat_interval_ms > 0 {
                    Duration::from_millis(ack.heartbeat_interval_ms)
                } else {
                    Duration::from_millis(self.link.heartbeat_interval_ms)
                };
                let mut inner = self.inner.lock();
                inner.session = Some(Session {
                    id: ack.session_id.clone(),
                    heartbeat_interval: interval,
                });
                inner.reconnect_attempts = 0;
                if inner.state == PluginState::Error {
                    inner.state = PluginState::Ready;
                }
                drop(inner);
                info!(
                    "registered with core: session_id={}, heartbeat_interval={}ms",
                    ack.session_id,
                    interval.as_millis()
                );
                true
            }
            Ok(ack) => {
                error!(
                    "registration rejected: {}",
                    ack.error.unwrap_or_else(|| "unspecified".to_string())
                );
                false
            }
            Err(e) => {
                error!("registration call failed: {e}");
                false
            }
        }
    }

    /// One reconnection attempt; the counter tracks consecutive failures
    /// and is reset by a successful registration.
    async fn reconnect(&self) -> bool {
        let Some(client) = self.client.clone() else {
            return false;
        };

        let attempt = {
            let mut inner = self.inner.lock();
            if inner.link_lost {
                return false;
            }
            if inner.reconnect_attempts >= self.link.max_reconnect_attempts {
                inner.link_lost = true;
                inner.state = PluginState::Error;
                inner.last_error =
                    Some("core link lost: max reconnection attempts reached".to_string());
                drop(inner);
                error!(
                    "max reconnection attempts ({}) reached, giving up on core link",
                    self.link.max_reconnect_attempts
                );
                return false;
            }
            inner.reconnect_attempts += 1;
            inner.reconnect_attempts
        };
        info!(
            "reconnection attempt {attempt}/{}",
            self.link.max_reconnect_attempts
        );

        let timeout = Duration::from_millis(self.link.connect_timeout_ms);
        client.wait_ready(timeout).await && self.register().await
    }

    // ======================================================================
    // Heartbeat
    // ======================================================================

    fn spawn_heartbeat(&self) {
        let mut slot = self.heartbeat_task.lock();
        if slot.is_some() {
            return;
        }
        let manager = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        *slot = Some(tokio::spawn(async move {
            manager.heartbeat_loop(&mut shutdown_rx).await;
        }));
        info!("heartbeat task started");
    }

    async fn heartbeat_loop(&self, shutdown_rx: &mut watch::Receiver<bool>) {
        loop {
            if !self.is_running() {
                break;
            }

            let sleep_for = match self.heartbeat_cycle().await {
                CycleOutcome::Normal => self.heartbeat_interval(),
                // Do not hot-loop a dead channel.
                CycleOutcome::LinkDown => Duration::from_millis(self.link.reconnect_interval_ms),
            };

            // Interruptible sleep: shutdown latency is bounded by the
            // watch channel, not by the heartbeat interval.
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("heartbeat loop exited");
    }

    async fn heartbeat_cycle(&self) -> CycleOutcome {
        if self.is_registered() {
            match self.send_heartbeat().await {
                HeartbeatOutcome::Acked | HeartbeatOutcome::NotAcked => CycleOutcome::Normal,
                HeartbeatOutcome::Failed => {
                    if self.reconnect().await {
                        CycleOutcome::Normal
                    } else {
                        CycleOutcome::LinkDown
                    }
                }
            }
        } else if self.reconnect().await {
            CycleOutcome::Normal
        } else {
            CycleOutcome::LinkDown
        }
    }

    async fn send_heartbeat(&self) -> HeartbeatOutcome {
        let Some(client) = self.client.clone() else {
            return HeartbeatOutcome::Failed;
        };
        let Some(session_id) = self.session_id() else {
            return HeartbeatOutcome::Failed;
        };

        let metrics = self.metrics();
        let request = HeartbeatRequest {
            plugin_id: self.identity.id.clone(),
            session_id,
            timestamp_ms: Utc::now().timestamp_millis(),
            status: StatusReport {
                state: self.state().as_str().to_string(),
                uptime_seconds: metrics.uptime_seconds,
                active_tasks: metrics.active_tasks,
                completed_tasks: metrics.completed_tasks,
                failed_tasks: metrics.failed_tasks,
                cpu_percent: metrics.cpu_percent,
                memory_bytes: metrics.memory_bytes,
                last_error: metrics.last_error,
            },
        };

        match client.heartbeat(request).await {
            Ok(ack) if ack.acknowledged => {
                for command in &ack.commands {
                    self.process_command(command);
                }
                HeartbeatOutcome::Acked
            }
            Ok(_) => {
                warn!("heartbeat not acknowledged by core");
                self.clear_session();
                HeartbeatOutcome::NotAcked
            }
            Err(e) => {
                warn!("heartbeat failed: {e}");
                self.clear_session();
                HeartbeatOutcome::Failed
            }
        }
    }

    // ======================================================================
    // Command handling
    // ======================================================================

    /// Register a handler for a custom command action. Handler errors are
    /// logged and never break the heartbeat loop. Commands may be delivered
    /// more than once; handlers should be idempotent.
    pub fn register_command_handler<F>(&self, action: &str, handler: F)
    where
        F: Fn(&HashMap<String, String>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .insert(action.to_string(), Arc::new(handler));
        debug!("registered command handler: {action}");
    }

    fn process_command(&self, command: &CoreCommand) {
        info!(
            "processing command: action={}, params={:?}",
            command.action, command.parameters
        );

        match command.action.as_str() {
            "pause" => self.handle_pause(),
            "resume" => self.handle_resume(),
            "shutdown" => self.handle_shutdown(),
            "reload" => self.handle_reload(),
            _ => {}
        }

        let handler = self.handlers.lock().get(&command.action).cloned();
        if let Some(handler) = handler {
            if let Err(e) = handler(&command.parameters) {
                error!("command handler {:?} failed: {e:#}", command.action);
            }
        }
    }

    fn handle_pause(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            PluginState::Ready | PluginState::Busy => {
                inner.state = PluginState::Paused;
                info!("plugin paused");
            }
            other => warn!("ignoring pause command in state {}", other.as_str()),
        }
    }

    fn handle_resume(&self) {
        let mut inner = self.inner.lock();
        if inner.state == PluginState::Paused {
            // Back to Ready; task accounting will move it to Busy if tasks
            // are still active.
            inner.state = if inner.active_tasks > 0 {
                PluginState::Busy
            } else {
                PluginState::Ready
            };
            info!("plugin resumed");
        } else {
            warn!("ignoring resume command in state {}", inner.state.as_str());
        }
    }

    fn handle_shutdown(&self) {
        info!("shutdown requested by core");
        self.inner.lock().running = false;
        let _ = self.shutdown_tx.send(true);
    }

    fn handle_reload(&self) {
        // Config reload itself is wired by the embedding process through a
        // custom handler on the same action.
        info!("reload requested by core");
    }

    // ======================================================================
    // Task accounting
    // ======================================================================

    /// Called when a task starts, from any execution context.
    pub fn task_started(&self) {
        let mut inner = self.inner.lock();
        inner.active_tasks += 1;
        if inner.state == PluginState::Ready {
            inner.state = PluginState::Busy;
        }
    }

    /// Called when a task completes successfully, from any execution context.
    pub fn task_completed(&self) {
        let mut inner = self.inner.lock();
        inner.active_tasks = inner.active_tasks.saturating_sub(1);
        inner.completed_tasks += 1;
        if inner.active_tasks == 0 && inner.state == PluginState::Busy {
            inner.state = PluginState::Ready;
        }
    }

    /// Called when a task fails, from any execution context.
    pub fn task_failed(&self, error: &str) {
        let mut inner = self.inner.lock();
        inner.active_tasks = inner.active_tasks.saturating_sub(1);
        inner.failed_tasks += 1;
        inner.last_error = Some(error.to_string());
        if inner.active_tasks == 0 && inner.state == PluginState::Busy {
            inner.state = PluginState::Ready;
        }
    }

    // ======================================================================
    // State access
    // ======================================================================

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    pub fn is_registered(&self) -> bool {
        self.inner.lock().session.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().state == PluginState::Paused
    }

    pub fn state(&self) -> PluginState {
        self.inner.lock().state
    }

    /// Effective heartbeat cadence: Core-dictated once registered, the
    /// configured fallback before that.
    pub fn heartbeat_interval(&self) -> Duration {
        self.inner
            .lock()
            .session
            .as_ref()
            .map(|s| s.heartbeat_interval)
            .unwrap_or_else(|| Duration::from_millis(self.link.heartbeat_interval_ms))
    }

    /// Fresh metrics snapshot; resource usage is sampled on every call.
    pub fn metrics(&self) -> PluginMetrics {
        // Sysinfo refresh happens outside the state lock.
        let sample = self.sampler.sample();
        let inner = self.inner.lock();
        PluginMetrics {
            uptime_seconds: self.started_at.elapsed().as_secs(),
            active_tasks: inner.active_tasks,
            completed_tasks: inner.completed_tasks,
            failed_tasks: inner.failed_tasks,
            cpu_percent: sample.cpu_percent,
            memory_bytes: sample.memory_bytes,
            last_error: inner.last_error.clone(),
        }
    }

    fn session_id(&self) -> Option<String> {
        self.inner.lock().session.as_ref().map(|s| s.id.clone())
    }

    fn clear_session(&self) {
        self.inner.lock().session = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoreLinkSettings, PluginIdentity};
    use crate::supervisor::mqtt::MqttSupervisorClient;

    fn standalone() -> LifecycleManager<MqttSupervisorClient> {
        LifecycleManager::new(
            PluginIdentity::default(),
            CoreLinkSettings::default(),
            50052,
            None,
        )
    }

    #[test]
    fn task_accounting_drives_busy_ready() {
        let manager = standalone();
        {
            let mut inner = manager.inner.lock();
            inner.running = true;
            inner.state = PluginState::Ready;
        }

        manager.task_started();
        manager.task_started();
        assert_eq!(manager.state(), PluginState::Busy);
        assert_eq!(manager.metrics().active_tasks, 2);

        manager.task_completed();
        assert_eq!(manager.state(), PluginState::Busy);

        manager.task_failed("boom");
        assert_eq!(manager.state(), PluginState::Ready);
        let metrics = manager.metrics();
        assert_eq!(metrics.active_tasks, 0);
        assert_eq!(metrics.completed_tasks, 1);
        assert_eq!(metrics.failed_tasks, 1);
        assert_eq!(metrics.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn active_count_never_goes_negative() {
        let manager = standalone();
        manager.task_completed();
        manager.task_failed("late failure");
        assert_eq!(manager.metrics().active_tasks, 0);
    }

    #[test]
    fn pause_only_from_ready_or_busy() {
        let manager = standalone();
        // Still Starting: pause is ignored.
        manager.handle_pause();
        assert_eq!(manager.state(), PluginState::Starting);

        manager.inner.lock().state = PluginState::Ready;
        manager.handle_pause();
        assert!(manager.is_paused());

        manager.handle_resume();
        assert_eq!(manager.state(), PluginState::Ready);
    }

    #[test]
    fn resume_returns_to_busy_with_active_tasks() {
        let manager = standalone();
        manager.inner.lock().state = PluginState::Ready;
        manager.task_started();
        manager.handle_pause();
        assert!(manager.is_paused());
        manager.handle_resume();
        assert_eq!(manager.state(), PluginState::Busy);
    }

    #[tokio::test]
    async fn standalone_start_and_stop() {
        let manager = standalone();
        assert!(manager.start().await);
        assert_eq!(manager.state(), PluginState::Ready);
        assert!(!manager.is_registered());
        assert!(manager.heartbeat_task.lock().is_none());
        // Second start is refused.
        assert!(!manager.start().await);

        manager.stop().await;
        assert!(!manager.is_running());
        assert_eq!(manager.state(), PluginState::Stopping);
        // Idempotent.
        manager.stop().await;
    }
}
