use std::env;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

const DEFAULT_SYN_TIMEOUT_MS: u64 = 1_000;
const DEFAULT_ACK_TIMEOUT_MS: u64 = 3_000;
pub(crate) const DEFAULT_PENDING_WINDOW_MS: u64 = 60_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Agent-sync configuration. Values come from an optional TOML file, then
/// `AGENT_SYNC_*` environment overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub log_filter: String,
    pub heartbeat: HeartbeatConfig,
    pub regions: RegionConfig,
    pub graphs: GraphConfig,
    pub failover: FailoverConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Delay between an ack (or a missed deadline) and the next SYN.
    pub syn_timeout_ms: u64,
    /// How long a SYN waits for its ack.
    pub ack_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RegionConfig {
    pub primary_name: String,
    pub primary_region: Option<String>,
    pub secondary_name: String,
    pub secondary_region: Option<String>,
    /// Region (or connection name) made active at startup.
    pub initial_region: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// How long a PENDING without INITIATED keeps its episode open.
    pub pending_window_ms: u64,
}

/// Business state names that feed the default transition graphs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub agent_error_states: Vec<String>,
    pub acw_state: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            log_filter: "info,agent_sync_core=debug".into(),
            heartbeat: HeartbeatConfig::default(),
            regions: RegionConfig::default(),
            graphs: GraphConfig::default(),
            failover: FailoverConfig::default(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            syn_timeout_ms: DEFAULT_SYN_TIMEOUT_MS,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
        }
    }
}

impl HeartbeatConfig {
    pub fn syn_timeout(&self) -> Duration {
        Duration::from_millis(self.syn_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            pending_window_ms: DEFAULT_PENDING_WINDOW_MS,
        }
    }
}

impl FailoverConfig {
    pub fn pending_window(&self) -> Duration {
        Duration::from_millis(self.pending_window_ms)
    }
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            primary_name: "primary".into(),
            primary_region: None,
            secondary_name: "secondary".into(),
            secondary_region: None,
            initial_region: None,
        }
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        let agent_error_states = [
            "Error",
            "AgentHungUp",
            "BadAddressAgent",
            "BadAddressCustomer",
            "Default",
            "FailedConnectAgent",
            "FailedConnectCustomer",
            "LineEngagedAgent",
            "LineEngagedCustomer",
            "MissedCallAgent",
            "MissedCallCustomer",
            "MultipleCcpWindows",
            "RealtimeCommunicationError",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        Self {
            agent_error_states,
            acw_state: "AfterCallWork".into(),
        }
    }
}

impl SyncConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Reads `AGENT_SYNC_CONFIG` (if set) and applies environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base = match env::var("AGENT_SYNC_CONFIG") {
            Ok(path) if !path.is_empty() => Self::load(path)?,
            _ => Self::default(),
        };
        Ok(base.with_env_overrides())
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(filter) = env::var("RUST_LOG") {
            self.log_filter = filter;
        }
        if let Some(ms) = env_u64("AGENT_SYNC_SYN_TIMEOUT_MS") {
            self.heartbeat.syn_timeout_ms = ms;
        }
        if let Some(ms) = env_u64("AGENT_SYNC_ACK_TIMEOUT_MS") {
            self.heartbeat.ack_timeout_ms = ms;
        }
        if let Some(ms) = env_u64("AGENT_SYNC_PENDING_WINDOW_MS") {
            self.failover.pending_window_ms = ms;
        }
        if let Ok(region) = env::var("AGENT_SYNC_INITIAL_REGION") {
            self.regions.initial_region = Some(region).filter(|r| !r.is_empty());
        }
        self
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // environment is process-wide
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    #[test]
    fn defaults_are_sane() {
        let config = SyncConfig::default();
        assert_eq!(config.heartbeat.syn_timeout(), Duration::from_secs(1));
        assert_eq!(config.heartbeat.ack_timeout(), Duration::from_secs(3));
        assert_eq!(config.regions.primary_name, "primary");
        assert!(config.graphs.agent_error_states.contains(&"AgentHungUp".to_string()));
        assert_eq!(config.graphs.acw_state, "AfterCallWork");
        assert_eq!(config.failover.pending_window(), Duration::from_secs(60));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = SyncConfig::from_toml_str(
            r#"
            [heartbeat]
            ack_timeout_ms = 250

            [regions]
            primary_region = "us-east-1"
            secondary_region = "us-west-2"

            [failover]
            pending_window_ms = 5000
            "#,
        )
        .expect("config parses");
        assert_eq!(config.heartbeat.ack_timeout_ms, 250);
        assert_eq!(config.heartbeat.syn_timeout_ms, DEFAULT_SYN_TIMEOUT_MS);
        assert_eq!(config.regions.primary_region.as_deref(), Some("us-east-1"));
        assert_eq!(config.regions.secondary_name, "secondary");
        assert_eq!(config.graphs, GraphConfig::default());
        assert_eq!(config.failover.pending_window_ms, 5_000);
    }

    #[test]
    fn malformed_toml_is_rejected() {
        let err = SyncConfig::from_toml_str("[heartbeat]\nack_timeout_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn env_overrides_apply() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe {
            env::set_var("AGENT_SYNC_ACK_TIMEOUT_MS", "42");
            env::set_var("AGENT_SYNC_INITIAL_REGION", "us-west-2");
            env::set_var("AGENT_SYNC_PENDING_WINDOW_MS", "750");
        }
        let config = SyncConfig::default().with_env_overrides();
        assert_eq!(config.heartbeat.ack_timeout_ms, 42);
        assert_eq!(config.regions.initial_region.as_deref(), Some("us-west-2"));
        assert_eq!(config.failover.pending_window_ms, 750);
        unsafe {
            env::remove_var("AGENT_SYNC_ACK_TIMEOUT_MS");
            env::remove_var("AGENT_SYNC_INITIAL_REGION");
            env::remove_var("AGENT_SYNC_PENDING_WINDOW_MS");
        }
    }

    #[test]
    fn missing_file_reports_path() {
        let err = SyncConfig::load("/nonexistent/agent-sync.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/agent-sync.toml"));
    }
}
