//! ChatMesh Configuration
//!
//! This module provides configuration structures for ChatMesh nodes and
//! for the membership registry process.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main ChatMesh configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatMeshConfig {
    /// Node-specific configuration (unused by the registry process)
    #[serde(default)]
    pub node: NodeConfig,

    /// Membership registry configuration
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Bully election timing
    #[serde(default)]
    pub election: ElectionSection,

    /// Berkeley clock synchronization
    #[serde(default)]
    pub sync: SyncSection,

    /// Replication and bootstrap
    #[serde(default)]
    pub replication: ReplicationSection,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    #[serde(default)]
    pub id: String,

    /// Address to bind for coordination traffic
    #[serde(default = "default_node_address")]
    pub bind_address: String,

    /// Advertised address for other nodes to connect
    #[serde(default)]
    pub advertise_address: Option<String>,

    /// Data directory for snapshots
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Persist the replicated state after every applied operation
    #[serde(default)]
    pub persist: bool,
}

/// Membership registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Registry address nodes connect to
    #[serde(default = "default_registry_address")]
    pub address: String,

    /// Address the registry process binds to
    #[serde(default = "default_registry_bind")]
    pub bind_address: String,

    /// Seconds without heartbeat before a member is inactive
    #[serde(default = "default_liveness_window_secs")]
    pub liveness_window_secs: u64,

    /// Seconds between liveness sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Node-side heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Request timeout for registry calls in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Election configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionSection {
    /// How long an electing node waits for an OK
    #[serde(default = "default_ok_timeout_ms")]
    pub ok_timeout_ms: u64,

    /// How long a node waits for the coordinator announcement after an OK
    #[serde(default = "default_coordinator_timeout_ms")]
    pub coordinator_timeout_ms: u64,

    /// Interval between coordinator liveness pings
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
}

/// Berkeley synchronization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSection {
    /// Client operations between synchronization rounds
    #[serde(default = "default_sync_every")]
    pub every_operations: u32,

    /// Collection window for time replies in milliseconds
    #[serde(default = "default_sync_window_ms")]
    pub window_ms: u64,
}

/// Replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSection {
    /// Per-peer wait for a bootstrap snapshot in milliseconds
    #[serde(default = "default_bootstrap_timeout_ms")]
    pub bootstrap_timeout_ms: u64,

    /// TCP connect timeout for peer delivery in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_node_address() -> String {
    "0.0.0.0:5561".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/chatmesh")
}

fn default_registry_address() -> String {
    "127.0.0.1:5559".to_string()
}

fn default_registry_bind() -> String {
    "0.0.0.0:5559".to_string()
}

fn default_liveness_window_secs() -> u64 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    10
}

fn default_heartbeat_interval_ms() -> u64 {
    5000
}

fn default_request_timeout_ms() -> u64 {
    3000
}

fn default_ok_timeout_ms() -> u64 {
    2000
}

fn default_coordinator_timeout_ms() -> u64 {
    5000
}

fn default_ping_interval_ms() -> u64 {
    1000
}

fn default_sync_every() -> u32 {
    10
}

fn default_sync_window_ms() -> u64 {
    1000
}

fn default_bootstrap_timeout_ms() -> u64 {
    3000
}

fn default_connect_timeout_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            bind_address: default_node_address(),
            advertise_address: None,
            data_dir: default_data_dir(),
            persist: false,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            address: default_registry_address(),
            bind_address: default_registry_bind(),
            liveness_window_secs: default_liveness_window_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Default for ElectionSection {
    fn default() -> Self {
        Self {
            ok_timeout_ms: default_ok_timeout_ms(),
            coordinator_timeout_ms: default_coordinator_timeout_ms(),
            ping_interval_ms: default_ping_interval_ms(),
        }
    }
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            every_operations: default_sync_every(),
            window_ms: default_sync_window_ms(),
        }
    }
}

impl Default for ReplicationSection {
    fn default() -> Self {
        Self {
            bootstrap_timeout_ms: default_bootstrap_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ChatMeshConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: ChatMeshConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate settings shared by every process role
    pub fn validate(&self) -> crate::Result<()> {
        if self.registry.liveness_window_secs == 0 {
            return Err(crate::Error::Config(
                "registry.liveness_window_secs must be positive".into(),
            ));
        }

        if self.registry.sweep_interval_secs == 0 || self.registry.heartbeat_interval_ms == 0 {
            return Err(crate::Error::Config(
                "registry sweep and heartbeat intervals must be positive".into(),
            ));
        }

        if self.election.ok_timeout_ms == 0 || self.election.coordinator_timeout_ms == 0 {
            return Err(crate::Error::Config("election timeouts must be positive".into()));
        }

        if self.sync.every_operations == 0 {
            return Err(crate::Error::Config("sync.every_operations must be positive".into()));
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => {
                return Err(crate::Error::Config(format!(
                    "logging.format must be \"pretty\" or \"json\", got \"{}\"",
                    other
                )))
            }
        }

        Ok(())
    }

    /// Validate settings a node process needs on top of [`validate`](Self::validate)
    pub fn validate_node(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.id.contains(':') {
            return Err(crate::Error::Config("node.id cannot contain ':'".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        if self.registry.address.is_empty() {
            return Err(crate::Error::Config("registry.address cannot be empty".into()));
        }

        Ok(())
    }

    /// Get the advertised address (or bind address if not set)
    pub fn advertise_address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.node.bind_address)
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the liveness window as Duration
    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.registry.liveness_window_secs)
    }

    /// Get the sweep interval as Duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.registry.sweep_interval_secs)
    }

    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.registry.heartbeat_interval_ms)
    }

    /// Get registry request timeout as Duration
    pub fn registry_timeout(&self) -> Duration {
        Duration::from_millis(self.registry.request_timeout_ms)
    }

    /// Get bootstrap timeout as Duration
    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_millis(self.replication.bootstrap_timeout_ms)
    }

    /// Get peer connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.replication.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "servidor_1"
bind_address = "0.0.0.0:5561"
advertise_address = "servidor_1:5561"
persist = true

[registry]
address = "referencia:5559"
heartbeat_interval_ms = 2000

[election]
ok_timeout_ms = 1500

[sync]
every_operations = 10
"#;

        let config = ChatMeshConfig::from_str(toml).unwrap();
        config.validate_node().unwrap();
        assert_eq!(config.node.id, "servidor_1");
        assert_eq!(config.advertise_address(), "servidor_1:5561");
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(2));
        assert_eq!(config.election.ok_timeout_ms, 1500);
        assert_eq!(config.election.coordinator_timeout_ms, 5000);
        assert_eq!(config.liveness_window(), Duration::from_secs(30));
        assert!(config.node.persist);
    }

    #[test]
    fn test_registry_only_config() {
        let toml = r#"
[registry]
bind_address = "0.0.0.0:5559"
"#;
        let config = ChatMeshConfig::from_str(toml).unwrap();
        assert!(config.validate_node().is_err());
        assert_eq!(config.sweep_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(ChatMeshConfig::from_str("[sync]\nevery_operations = 0\n").is_err());
        assert!(ChatMeshConfig::from_str("[logging]\nformat = \"xml\"\n").is_err());
    }
}
