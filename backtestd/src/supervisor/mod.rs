//! Core link: plugin protocol messages and the client seam.
//!
//! The lifecycle manager only ever talks to the Core through the
//! `SupervisorClient` trait, so the transport stays swappable:
//! - `mqtt::MqttSupervisorClient` for the real broker-backed link
//! - `devkit::StubSupervisor` for tests and broker-less development

pub mod mqtt;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Errors on the Core link.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("core link transport error: {0}")]
    Transport(String),
    #[error("core did not answer within {0:?}")]
    Timeout(Duration),
    #[error("core link is closed")]
    Closed,
}

/// Registration request (plugins.register@v1 contract).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub plugin_id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub plugin_type: String,
    pub capabilities: Vec<String>,
    /// Address the Core calls back on to submit work.
    pub callback_address: String,
}

/// Registration result (plugins.register@v1 contract).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAck {
    pub success: bool,
    #[serde(default)]
    pub session_id: String,
    /// Core-dictated heartbeat cadence; 0 means "keep your default".
    #[serde(default)]
    pub heartbeat_interval_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
}

/// Status payload carried by every heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub state: String,
    pub uptime_seconds: u64,
    pub active_tasks: u32,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub cpu_percent: f32,
    pub memory_bytes: u64,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Heartbeat request (plugins.heartbeat@v1 contract).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub plugin_id: String,
    pub session_id: String,
    /// Client clock, milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    pub status: StatusReport,
}

/// Command piggybacked on a heartbeat acknowledgement (Core -> plugin).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreCommand {
    pub action: String,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Heartbeat result (plugins.heartbeat@v1 contract).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub acknowledged: bool,
    #[serde(default)]
    pub commands: Vec<CoreCommand>,
}

/// Unregistration request (plugins.unregister@v1 contract).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterRequest {
    pub plugin_id: String,
    pub session_id: String,
    pub reason: String,
}

/// Unregistration result (plugins.unregister@v1 contract).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregisterAck {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Request/response channel to the Core.
///
/// Every call blocks (asynchronously) until the Core answers or the
/// transport's own timeout fires. Implementations must be safe to share
/// behind an `Arc` between the startup path and the heartbeat task.
#[async_trait]
pub trait SupervisorClient: Send + Sync {
    /// Wait until the underlying connection is usable, up to `timeout`.
    async fn wait_ready(&self, timeout: Duration) -> bool;

    async fn register(&self, request: RegisterRequest) -> Result<RegisterAck, SupervisorError>;

    async fn heartbeat(&self, request: HeartbeatRequest) -> Result<HeartbeatAck, SupervisorError>;

    async fn unregister(
        &self,
        request: UnregisterRequest,
    ) -> Result<UnregisterAck, SupervisorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_ack_tolerates_missing_commands() {
        let ack: HeartbeatAck = serde_json::from_str(r#"{"acknowledged": true}"#).unwrap();
        assert!(ack.acknowledged);
        assert!(ack.commands.is_empty());
    }

    #[test]
    fn register_ack_rejection_round_trip() {
        let ack: RegisterAck =
            serde_json::from_str(r#"{"success": false, "error": "unknown plugin type"}"#).unwrap();
        assert!(!ack.success);
        assert_eq!(ack.error.as_deref(), Some("unknown plugin type"));
        assert_eq!(ack.heartbeat_interval_ms, 0);
    }
}
