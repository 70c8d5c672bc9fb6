//! Plugin settings.
//!
//! Layered the usual way: TOML settings file, then environment variables,
//! then CLI flags (applied by the binary). Every section has working
//! defaults so the plugin boots with no file at all.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::checkpoint::CheckpointConfig;

/// Who this plugin is, as declared to the Core at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginIdentity {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub plugin_type: String,
    pub capabilities: Vec<String>,
}

impl Default for PluginIdentity {
    fn default() -> Self {
        Self {
            id: "org.backtestd.engine".to_string(),
            name: "Backtest Engine".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: "Rust backtest engine plugin".to_string(),
            plugin_type: "backtest".to_string(),
            capabilities: vec![
                "streaming".to_string(),
                "batch".to_string(),
                "historical".to_string(),
            ],
        }
    }
}

/// Core link parameters and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreLinkSettings {
    /// `host:port` of the broker the Core listens behind; `None` means
    /// standalone operation (no registration, no heartbeat).
    pub address: Option<String>,
    /// Fallback heartbeat cadence, used until the Core dictates its own.
    pub heartbeat_interval_ms: u64,
    /// Sleep between cycles while the link is down.
    pub reconnect_interval_ms: u64,
    /// Consecutive reconnection failures tolerated before the link is
    /// declared lost for the remainder of the process.
    pub max_reconnect_attempts: u32,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for CoreLinkSettings {
    fn default() -> Self {
        Self {
            address: None,
            heartbeat_interval_ms: 5_000,
            reconnect_interval_ms: 10_000,
            max_reconnect_attempts: 10,
            connect_timeout_ms: 5_000,
            request_timeout_ms: 5_000,
        }
    }
}

/// Callback surface advertised to the Core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenSettings {
    pub port: u16,
}

impl Default for ListenSettings {
    fn default() -> Self {
        Self { port: 50052 }
    }
}

/// Checkpoint policy plus where the bundled store keeps its files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSettings {
    pub data_dir: PathBuf,
    #[serde(flatten)]
    pub policy: CheckpointConfig,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./checkpoints"),
            policy: CheckpointConfig::default(),
        }
    }
}

/// Top-level settings for the plugin process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginSettings {
    pub plugin: PluginIdentity,
    pub core: CoreLinkSettings,
    pub listen: ListenSettings,
    pub checkpoint: CheckpointSettings,
}

impl PluginSettings {
    /// Load settings from `path`, or from `$BACKTESTD_CONFIG` /
    /// `backtestd.toml`, falling back to defaults when no file exists.
    /// Environment overrides are applied last.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => PathBuf::from(
                std::env::var("BACKTESTD_CONFIG").unwrap_or_else(|_| "backtestd.toml".to_string()),
            ),
        };

        let mut settings = if path.exists() {
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("read settings file {path:?}"))?;
            toml::from_str(&content).with_context(|| format!("parse settings file {path:?}"))?
        } else {
            info!("no settings file at {path:?}, using defaults");
            Self::default()
        };

        settings.apply_env_overrides(&collect_env());
        Ok(settings)
    }

    fn apply_env_overrides(&mut self, env: &HashMap<String, String>) {
        if let Some(address) = env.get("BACKTESTD_CORE_ADDRESS") {
            self.core.address = Some(address.clone());
        }
        if let Some(dir) = env.get("BACKTESTD_DATA_DIR") {
            self.checkpoint.data_dir = PathBuf::from(dir);
        }
        if let Some(port) = env.get("BACKTESTD_PORT") {
            match port.parse() {
                Ok(port) => self.listen.port = port,
                Err(_) => warn!("ignoring invalid BACKTESTD_PORT: {port:?}"),
            }
        }
    }
}

fn collect_env() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(k, _)| k.starts_with("BACKTESTD_"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_standalone() {
        let settings = PluginSettings::default();
        assert!(settings.core.address.is_none());
        assert_eq!(settings.core.heartbeat_interval_ms, 5_000);
        assert_eq!(settings.listen.port, 50052);
        assert!(settings.checkpoint.policy.enabled);
    }

    #[test]
    fn parses_partial_settings_file() {
        let settings: PluginSettings = toml::from_str(
            r#"
            [plugin]
            id = "org.backtestd.engine-test"

            [core]
            address = "localhost:1883"
            heartbeat_interval_ms = 2000

            [checkpoint]
            data_dir = "/tmp/ckpt"
            interval = 25
            "#,
        )
        .unwrap();
        assert_eq!(settings.plugin.id, "org.backtestd.engine-test");
        // Unset fields keep their defaults.
        assert_eq!(settings.plugin.plugin_type, "backtest");
        assert_eq!(settings.core.address.as_deref(), Some("localhost:1883"));
        assert_eq!(settings.core.heartbeat_interval_ms, 2_000);
        assert_eq!(settings.core.max_reconnect_attempts, 10);
        assert_eq!(settings.checkpoint.data_dir, PathBuf::from("/tmp/ckpt"));
        assert_eq!(settings.checkpoint.policy.interval, 25);
        assert_eq!(settings.checkpoint.policy.max_count, 5);
    }

    #[test]
    fn env_overrides_win() {
        let mut settings = PluginSettings::default();
        let mut env = HashMap::new();
        env.insert(
            "BACKTESTD_CORE_ADDRESS".to_string(),
            "broker:1884".to_string(),
        );
        env.insert("BACKTESTD_PORT".to_string(), "60000".to_string());
        settings.apply_env_overrides(&env);
        assert_eq!(settings.core.address.as_deref(), Some("broker:1884"));
        assert_eq!(settings.listen.port, 60_000);
    }
}
