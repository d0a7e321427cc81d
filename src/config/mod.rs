use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use std::path::PathBuf;
use std::time::Duration;

use crate::address::NodeAddress;
use crate::gateway::AckPolicy;
use crate::packet::DataRecord;

/// Node ID type used by openraft membership, derived from [`NodeAddress::node_id`]
pub type NodeId = u64;

/// Membership entry for one node: where its inbound packet channel lives
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq, Default)]
pub struct Node {
    pub address: String,
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Node {{ address: {} }}", self.address)
    }
}

impl From<&NodeAddress> for Node {
    fn from(address: &NodeAddress) -> Self {
        Self {
            address: address.to_string(),
        }
    }
}

// The engine log only carries membership and blank entries; client data is
// broadcast as packets and never proposed.
openraft::declare_raft_types!(
    pub TypeConfig:
        D = DataRecord,
        R = (),
        Node = Node,
);

/// Complete node configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RaftlinkConfig {
    pub node: NodeConfig,
    pub cluster: ClusterConfig,
    pub raft: RaftConfig,
    pub storage: StorageConfig,
    pub gateway: GatewayConfig,
    pub network: NetworkConfig,
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Inbound packet channel, `scheme://host:port`. Also the node's identity.
    pub address: String,
    /// Node name (optional, for display purposes)
    pub name: Option<String>,
}

/// Static cluster membership
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name (for identification)
    pub name: String,
    /// Every node address in the cluster. The local address may be listed; it is
    /// skipped when joining.
    #[serde(default)]
    pub peers: Vec<String>,
}

/// Election and heartbeat timing handed to the consensus engine
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Minimum election timeout
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub election_timeout_min: Duration,
    /// Maximum election timeout
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub election_timeout_max: Duration,
    /// Heartbeat interval
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub heartbeat_interval: Duration,
}

/// Persistent store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory. Data lives under `db/<address key>`, the engine log under
    /// `log/<address key>`.
    pub path: PathBuf,
    /// Upper bound on the data store size, in bytes
    pub max_size_bytes: u64,
    /// Upper bound on files the store keeps open
    pub max_handles: u32,
}

/// Client gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// The gateway binds at the node port plus this offset
    pub port_offset: u16,
    /// When a SET is acknowledged to the client
    pub ack_policy: AckPolicy,
    /// HTTP worker threads for the gateway server
    pub workers: usize,
}

/// Peer transport configuration
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Timeout for a single packet round trip
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub request_timeout: Duration,
    /// Timeout for establishing a peer connection
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub connect_timeout: Duration,
    /// Evict a cached peer connection after this many consecutive failed sends.
    /// Zero keeps connections for the life of the process.
    pub max_consecutive_failures: u32,
    /// HTTP worker threads for the inbound packet server
    pub workers: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty, compact)
    pub format: LogFormat,
    /// Include the event target in log lines
    pub structured: bool,
    /// Enable ANSI colors in output
    pub enable_colors: bool,
}

/// Log output format
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8081".to_string(),
            name: None,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "raftlink-cluster".to_string(),
            peers: vec![
                "http://127.0.0.1:8081".to_string(),
                "http://127.0.0.1:8082".to_string(),
            ],
        }
    }
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(2000),
            election_timeout_max: Duration::from_millis(5000),
            heartbeat_interval: Duration::from_millis(1000),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data"),
            max_size_bytes: 2 * 1024 * 1024 * 1024, // 2GB
            max_handles: 10,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port_offset: 100,
            ack_policy: AckPolicy::OnBroadcast,
            workers: 2,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            max_consecutive_failures: 3,
            workers: 2,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            structured: false,
            enable_colors: true,
        }
    }
}

/// Configuration loading and management
impl RaftlinkConfig {
    /// Load configuration from file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;

        let config: Self =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content)?;

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let own = self.own_address()?;
        self.peer_addresses()?;

        if self.raft.election_timeout_min >= self.raft.election_timeout_max {
            return Err(ConfigError::Validation(
                "Election timeout min must be less than max".to_string(),
            ));
        }

        if self.raft.heartbeat_interval >= self.raft.election_timeout_min {
            return Err(ConfigError::Validation(
                "Heartbeat interval must be shorter than the minimum election timeout".to_string(),
            ));
        }

        own.with_port_offset(self.gateway.port_offset)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        if self.gateway.port_offset == 0 {
            return Err(ConfigError::Validation(
                "Gateway port offset cannot be 0".to_string(),
            ));
        }

        if self.storage.max_size_bytes == 0 || self.storage.max_handles == 0 {
            return Err(ConfigError::Validation(
                "Storage size and handle limits must be greater than 0".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level, valid_levels
            )));
        }

        Ok(())
    }

    /// This node's parsed address
    pub fn own_address(&self) -> Result<NodeAddress, ConfigError> {
        self.node
            .address
            .parse()
            .map_err(|e| ConfigError::Validation(format!("Invalid node address: {e}")))
    }

    /// Parsed peer list, in configuration order
    pub fn peer_addresses(&self) -> Result<Vec<NodeAddress>, ConfigError> {
        self.cluster
            .peers
            .iter()
            .map(|p| {
                p.parse()
                    .map_err(|e| ConfigError::Validation(format!("Invalid peer address: {e}")))
            })
            .collect()
    }

    /// Address the client gateway binds to
    pub fn gateway_address(&self) -> Result<NodeAddress, ConfigError> {
        self.own_address()?
            .with_port_offset(self.gateway.port_offset)
            .map_err(|e| ConfigError::Validation(e.to_string()))
    }

    /// Where the data store for `address` lives
    pub fn data_path(&self, address: &NodeAddress) -> PathBuf {
        self.storage.path.join("db").join(address.storage_key())
    }

    /// Where the engine log for `address` lives
    pub fn log_path(&self, address: &NodeAddress) -> PathBuf {
        self.storage.path.join("log").join(address.storage_key())
    }

    /// Get default configuration file paths
    pub fn default_config_paths() -> Vec<PathBuf> {
        let mut paths = vec![
            PathBuf::from("raftlink.toml"),
            PathBuf::from("config/raftlink.toml"),
            PathBuf::from("/etc/raftlink/config.toml"),
        ];

        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("raftlink").join("config.toml"));
        }

        if let Some(home_dir) = dirs::home_dir() {
            paths.push(home_dir.join(".raftlink.toml"));
        }

        paths
    }

    /// Find and load configuration file from default locations
    pub fn load_default() -> Result<Self, ConfigError> {
        for path in Self::default_config_paths() {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Ok(Self::default())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Build the engine's timing configuration
pub fn create_raft_config(config: &RaftConfig) -> openraft::Config {
    openraft::Config {
        heartbeat_interval: config.heartbeat_interval.as_millis() as u64,
        election_timeout_min: config.election_timeout_min.as_millis() as u64,
        election_timeout_max: config.election_timeout_max.as_millis() as u64,
        ..Default::default()
    }
}
