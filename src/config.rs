//! PeerLock Configuration
//!
//! This module provides configuration structures for a PeerLock node.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main PeerLock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerLockConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Peer directory configuration
    pub directory: DirectoryConfig,

    /// Protocol timing
    #[serde(default)]
    pub timing: TimingConfig,

    /// Mutual exclusion policy
    #[serde(default)]
    pub mutex: MutexPolicyConfig,

    /// Inbound call handling
    #[serde(default)]
    pub network: NetworkConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier, also the directory name
    pub id: String,

    /// Address to bind for peer communication
    pub bind_address: String,

    /// Advertised address for other nodes to connect
    #[serde(default)]
    pub advertise_address: Option<String>,

    /// Directory prefix shared by every peer of this group
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

/// Peer directory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Address of the directory service
    #[serde(default = "default_directory_address")]
    pub address: String,
}

/// Protocol timing, all in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// How long a grant is held before it is released automatically
    #[serde(default = "default_resource_access_ms")]
    pub resource_access_ms: u64,

    /// Heartbeat send and sweep interval
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Silence after which a peer is evicted
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Upper bound on waiting for replies to a request
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Wait for a coordinator announcement after challenging higher peers
    #[serde(default = "default_election_timeout_ms")]
    pub election_timeout_ms: u64,

    /// Coordinator liveness check interval
    #[serde(default = "default_liveness_check_interval_ms")]
    pub liveness_check_interval_ms: u64,

    /// Outbound connect timeout
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// What a request does when some peers never reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RequestTimeoutPolicy {
    /// Enter anyway, treating silent peers as dead. Favors liveness; two
    /// nodes can hold the resource at once under a partition.
    #[default]
    Proceed,
    /// Give up and return to RELEASED. Never violates exclusion.
    Abort,
}

impl std::fmt::Display for RequestTimeoutPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestTimeoutPolicy::Proceed => write!(f, "proceed"),
            RequestTimeoutPolicy::Abort => write!(f, "abort"),
        }
    }
}

/// Mutual exclusion policy
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MutexPolicyConfig {
    #[serde(default)]
    pub on_request_timeout: RequestTimeoutPolicy,
}

/// Inbound call handling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Connections served concurrently
    #[serde(default = "default_max_inbound_calls")]
    pub max_inbound_calls: usize,
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
fn default_namespace() -> String {
    "ricart.".to_string()
}

fn default_directory_address() -> String {
    "127.0.0.1:7600".to_string()
}

fn default_resource_access_ms() -> u64 {
    5000
}

fn default_heartbeat_interval_ms() -> u64 {
    2000
}

fn default_heartbeat_timeout_ms() -> u64 {
    6000
}

fn default_request_timeout_ms() -> u64 {
    10000
}

fn default_election_timeout_ms() -> u64 {
    3000
}

fn default_liveness_check_interval_ms() -> u64 {
    5000
}

fn default_connect_timeout_ms() -> u64 {
    1000
}

fn default_max_inbound_calls() -> usize {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            resource_access_ms: default_resource_access_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            election_timeout_ms: default_election_timeout_ms(),
            liveness_check_interval_ms: default_liveness_check_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_inbound_calls: default_max_inbound_calls(),
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

impl TimingConfig {
    pub fn resource_access(&self) -> Duration {
        Duration::from_millis(self.resource_access_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn liveness_check_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_check_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Validate the timing section
    pub fn validate(&self) -> crate::Result<()> {
        let fields = [
            ("timing.resource_access_ms", self.resource_access_ms),
            ("timing.heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("timing.heartbeat_timeout_ms", self.heartbeat_timeout_ms),
            ("timing.request_timeout_ms", self.request_timeout_ms),
            ("timing.election_timeout_ms", self.election_timeout_ms),
            ("timing.liveness_check_interval_ms", self.liveness_check_interval_ms),
            ("timing.connect_timeout_ms", self.connect_timeout_ms),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(crate::Error::Config(format!("{} must be greater than 0", name)));
            }
        }

        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(crate::Error::Config(
                "timing.heartbeat_timeout_ms must exceed timing.heartbeat_interval_ms".into(),
            ));
        }

        Ok(())
    }
}

impl PeerLockConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: PeerLockConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Sample configuration for `peerlock init`
    pub fn sample(node_id: &str) -> Self {
        Self {
            node: NodeConfig {
                id: node_id.to_string(),
                bind_address: "127.0.0.1:7701".to_string(),
                advertise_address: None,
                namespace: default_namespace(),
            },
            directory: DirectoryConfig {
                address: default_directory_address(),
            },
            timing: TimingConfig::default(),
            mutex: MutexPolicyConfig::default(),
            network: NetworkConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(crate::Error::Config("node.bind_address cannot be empty".into()));
        }

        if !self.node.id.starts_with(&self.node.namespace) {
            return Err(crate::Error::Config(format!(
                "node.id '{}' must start with namespace '{}'",
                self.node.id, self.node.namespace
            )));
        }

        if self.directory.address.is_empty() {
            return Err(crate::Error::Config("directory.address cannot be empty".into()));
        }

        self.timing.validate()
    }

    /// Get the advertised address (or bind address if not set)
    pub fn advertise_address(&self) -> &str {
        self.node
            .advertise_address
            .as_deref()
            .unwrap_or(&self.node.bind_address)
    }
}
