//! Replicore Configuration
//!
//! This module provides configuration structures for a replicore node.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::role::Role;
use crate::types::NodeName;

/// Main Replicore configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicoreConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Storage wait configuration
    #[serde(default)]
    pub storage: StorageConfig,

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
    /// Node name, which is also the RPC address other nodes dial (host:port)
    pub name: String,

    /// Role of this node for the lifetime of the process
    #[serde(default = "default_role")]
    pub role: Role,

    /// Address to bind the RPC listener on (defaults to the node name)
    #[serde(default)]
    pub bind_address: Option<String>,

    /// Data directory for the on-disk schema
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Nodes probed for liveness and core discovery besides the known peers
    #[serde(default)]
    pub seeds: Vec<String>,

    /// Liveness probe interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Per-call RPC timeout in milliseconds
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    /// RPC connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// How long a replicant waits for a core node of a shard
    #[serde(default = "default_core_node_wait_ms")]
    pub core_node_wait_ms: u64,
}

/// Storage readiness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Poll interval while waiting for storage start/stop
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Per-round timeout while waiting for tables to load
    #[serde(default = "default_table_wait_timeout_ms")]
    pub table_wait_timeout_ms: u64,

    /// Maximum table wait rounds (0 = unlimited)
    #[serde(default)]
    pub table_wait_rounds: u32,
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
}

// Default value functions
fn default_role() -> Role {
    Role::Core
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/replicore")
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_rpc_timeout_ms() -> u64 {
    15000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_core_node_wait_ms() -> u64 {
    5000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_table_wait_timeout_ms() -> u64 {
    30000
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8470".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            core_node_wait_ms: default_core_node_wait_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            table_wait_timeout_ms: default_table_wait_timeout_ms(),
            table_wait_rounds: 0,
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
        }
    }
}

impl ReplicoreConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: ReplicoreConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.name.is_empty() {
            return Err(crate::Error::Config("node.name cannot be empty".into()));
        }

        if !self.node.name.contains(':') {
            return Err(crate::Error::Config(
                "node.name must be a host:port address".into(),
            ));
        }

        if self.cluster.heartbeat_interval_ms == 0 {
            return Err(crate::Error::Config(
                "cluster.heartbeat_interval_ms must be positive".into(),
            ));
        }

        if self.storage.poll_interval_ms == 0 {
            return Err(crate::Error::Config(
                "storage.poll_interval_ms must be positive".into(),
            ));
        }

        Ok(())
    }

    /// This node's name
    pub fn node_name(&self) -> NodeName {
        NodeName::new(self.node.name.clone())
    }

    /// Address the RPC listener binds to
    pub fn bind_address(&self) -> &str {
        self.node
            .bind_address
            .as_deref()
            .unwrap_or(&self.node.name)
    }

    /// Seed nodes, excluding this node
    pub fn seeds(&self) -> Vec<NodeName> {
        self.cluster
            .seeds
            .iter()
            .filter(|s| **s != self.node.name)
            .map(|s| NodeName::new(s.clone()))
            .collect()
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.heartbeat_interval_ms)
    }

    /// Get RPC timeout as Duration
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.rpc_timeout_ms)
    }

    /// Get RPC connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.connect_timeout_ms)
    }

    /// Get core node wait as Duration
    pub fn core_node_wait(&self) -> Duration {
        Duration::from_millis(self.cluster.core_node_wait_ms)
    }

    /// Replicant attachment lease (3x heartbeat interval)
    pub fn replicant_lease(&self) -> Duration {
        self.heartbeat_interval() * 3
    }
}
