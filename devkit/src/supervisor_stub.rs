//! In-memory Core stub for developing and testing the plugin without a broker.
//!
//! Implements `SupervisorClient` entirely in memory:
//! - scripted registration results and heartbeat acknowledgements
//! - command injection into the next heartbeat response
//! - call counters for test assertions

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;

use backtestd::supervisor::{
    CoreCommand, HeartbeatAck, HeartbeatRequest, RegisterAck, RegisterRequest, SupervisorClient,
    SupervisorError, UnregisterAck, UnregisterRequest,
};

#[derive(Debug, Default)]
struct StubState {
    ready: bool,
    reject_register: bool,
    fail_register: bool,
    fail_heartbeat: bool,
    ack_heartbeats: bool,
    heartbeat_interval_ms: u64,
    pending_commands: VecDeque<CoreCommand>,
    register_calls: u32,
    heartbeat_calls: u32,
    unregister_calls: u32,
    last_status_state: Option<String>,
}

/// Scriptable stand-in for the Core side of the plugin protocol.
pub struct StubSupervisor {
    state: Mutex<StubState>,
}

impl StubSupervisor {
    /// Ready stub that accepts registration and acknowledges heartbeats.
    pub fn new(heartbeat_interval_ms: u64) -> Self {
        Self {
            state: Mutex::new(StubState {
                ready: true,
                ack_heartbeats: true,
                heartbeat_interval_ms,
                ..StubState::default()
            }),
        }
    }

    /// Stub that never becomes ready (connect timeout path).
    pub fn unreachable() -> Self {
        Self {
            state: Mutex::new(StubState::default()),
        }
    }

    /// Queue a command for delivery in the next acknowledged heartbeat.
    pub fn push_command(&self, action: &str, parameters: &[(&str, &str)]) {
        let command = CoreCommand {
            action: action.to_string(),
            parameters: parameters
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        self.state.lock().pending_commands.push_back(command);
    }

    /// Make registration return `success = false` (Core rejects the plugin).
    pub fn set_reject_register(&self, reject: bool) {
        self.state.lock().reject_register = reject;
    }

    /// Make registration fail at the transport level.
    pub fn set_fail_register(&self, fail: bool) {
        self.state.lock().fail_register = fail;
    }

    /// Make heartbeats fail at the transport level.
    pub fn set_fail_heartbeat(&self, fail: bool) {
        self.state.lock().fail_heartbeat = fail;
    }

    /// Make heartbeats succeed but come back unacknowledged.
    pub fn set_ack_heartbeats(&self, ack: bool) {
        self.state.lock().ack_heartbeats = ack;
    }

    pub fn register_calls(&self) -> u32 {
        self.state.lock().register_calls
    }

    pub fn heartbeat_calls(&self) -> u32 {
        self.state.lock().heartbeat_calls
    }

    pub fn unregister_calls(&self) -> u32 {
        self.state.lock().unregister_calls
    }

    /// State string carried by the most recent heartbeat status payload.
    pub fn last_status_state(&self) -> Option<String> {
        self.state.lock().last_status_state.clone()
    }
}

#[async_trait]
impl SupervisorClient for StubSupervisor {
    async fn wait_ready(&self, _timeout: Duration) -> bool {
        self.state.lock().ready
    }

    async fn register(&self, request: RegisterRequest) -> Result<RegisterAck, SupervisorError> {
        let mut state = self.state.lock();
        state.register_calls += 1;
        if state.fail_register {
            return Err(SupervisorError::Transport("stub register failure".into()));
        }
        if state.reject_register {
            return Ok(RegisterAck {
                success: false,
                session_id: String::new(),
                heartbeat_interval_ms: 0,
                error: Some(format!("plugin {} not allowed", request.plugin_id)),
            });
        }
        Ok(RegisterAck {
            success: true,
            session_id: format!("session-{}", state.register_calls),
            heartbeat_interval_ms: state.heartbeat_interval_ms,
            error: None,
        })
    }

    async fn heartbeat(&self, request: HeartbeatRequest) -> Result<HeartbeatAck, SupervisorError> {
        let mut state = self.state.lock();
        state.heartbeat_calls += 1;
        state.last_status_state = Some(request.status.state.clone());
        if state.fail_heartbeat {
            return Err(SupervisorError::Transport("stub heartbeat failure".into()));
        }
        if !state.ack_heartbeats {
            return Ok(HeartbeatAck {
                acknowledged: false,
                commands: Vec::new(),
            });
        }
        Ok(HeartbeatAck {
            acknowledged: true,
            commands: state.pending_commands.drain(..).collect(),
        })
    }

    async fn unregister(
        &self,
        _request: UnregisterRequest,
    ) -> Result<UnregisterAck, SupervisorError> {
        let mut state = self.state.lock();
        state.unregister_calls += 1;
        Ok(UnregisterAck {
            success: true,
            error: None,
        })
    }
}
