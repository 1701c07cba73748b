//! Packlog Configuration
//!
//! Configuration structures for a packlog node: identity, addresses,
//! storage limits, consensus timing, and security material paths.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main packlog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacklogConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Segment storage configuration
    #[serde(default)]
    pub segment: SegmentConfig,

    /// Consensus configuration
    #[serde(default)]
    pub consensus: ConsensusConfig,

    /// Access control configuration
    #[serde(default)]
    pub acl: AclConfig,

    /// TLS configuration
    #[serde(default)]
    pub tls: TlsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node name
    pub name: String,

    /// Address to bind for gossip membership (host:port)
    pub bind_addr: String,

    /// Port for the shared RPC/consensus listener
    #[serde(default = "default_rpc_port")]
    pub rpc_port: u16,

    /// Data directory for log segments and consensus state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Bootstrap this node as the initial cluster voter
    #[serde(default)]
    pub bootstrap: bool,

    /// Addresses of existing members to join on startup
    #[serde(default)]
    pub start_join_addrs: Vec<String>,
}

/// Segment storage configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SegmentConfig {
    /// Maximum store file size in bytes before rollover
    #[serde(default = "default_max_store_bytes")]
    pub max_store_bytes: u64,

    /// Maximum index file size in bytes before rollover
    #[serde(default = "default_max_index_bytes")]
    pub max_index_bytes: u64,

    /// Offset assigned to the first record of a fresh log
    #[serde(default)]
    pub initial_offset: u64,
}

/// Consensus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Minimum election timeout in milliseconds
    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,

    /// Maximum election timeout in milliseconds
    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,

    /// How long an append waits for commit before timing out, in milliseconds
    #[serde(default = "default_apply_timeout_ms")]
    pub apply_timeout_ms: u64,

    /// Applied commands between snapshots (0 disables snapshotting)
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: u64,
}

/// Access control configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AclConfig {
    /// Path to the ACL model file
    pub model_file: Option<PathBuf>,

    /// Path to the ACL policy file
    pub policy_file: Option<PathBuf>,
}

/// TLS configuration
///
/// Three cert/key/ca triples: one for the server side of client RPC,
/// one for serving peers, one for dialing peers. Loading the PEM
/// material happens at the CLI edge; empty paths disable TLS.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Server certificate file (PEM)
    pub server_cert_file: Option<PathBuf>,

    /// Server private key file (PEM)
    pub server_key_file: Option<PathBuf>,

    /// CA certificate for verifying clients (enables mutual TLS)
    pub server_ca_file: Option<PathBuf>,

    /// Peer certificate file (PEM)
    pub peer_cert_file: Option<PathBuf>,

    /// Peer private key file (PEM)
    pub peer_key_file: Option<PathBuf>,

    /// CA certificate for verifying peers
    pub peer_ca_file: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_rpc_port() -> u16 {
    8400
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/packlog")
}

fn default_max_store_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_max_index_bytes() -> u64 {
    1024 * 1024
}

fn default_heartbeat_interval_ms() -> u64 {
    150
}

fn default_election_timeout_min_ms() -> u64 {
    1000
}

fn default_election_timeout_max_ms() -> u64 {
    1500
}

fn default_apply_timeout_ms() -> u64 {
    10_000
}

fn default_snapshot_threshold() -> u64 {
    8192
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            max_store_bytes: default_max_store_bytes(),
            max_index_bytes: default_max_index_bytes(),
            initial_offset: 0,
        }
    }
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            election_timeout_min_ms: default_election_timeout_min_ms(),
            election_timeout_max_ms: default_election_timeout_max_ms(),
            apply_timeout_ms: default_apply_timeout_ms(),
            snapshot_threshold: default_snapshot_threshold(),
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

impl ConsensusConfig {
    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Get the apply commit timeout as Duration
    pub fn apply_timeout(&self) -> Duration {
        Duration::from_millis(self.apply_timeout_ms)
    }
}

impl PacklogConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: PacklogConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.name.is_empty() {
            return Err(crate::Error::Config("node.name cannot be empty".into()));
        }

        if self.node.bind_addr.is_empty() {
            return Err(crate::Error::Config(
                "node.bind_addr cannot be empty".into(),
            ));
        }

        if self.consensus.election_timeout_min_ms > self.consensus.election_timeout_max_ms {
            return Err(crate::Error::Config(
                "consensus.election_timeout_min_ms must not exceed election_timeout_max_ms".into(),
            ));
        }

        Ok(())
    }

    /// RPC address: gossip bind host plus the configured RPC port
    pub fn rpc_addr(&self) -> crate::Result<String> {
        let host = self
            .node
            .bind_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .ok_or_else(|| {
                crate::Error::Config(format!("invalid bind_addr: {}", self.node.bind_addr))
            })?;
        Ok(format!("{}:{}", host, self.node.rpc_port))
    }

    /// Get the user log directory path
    pub fn log_dir(&self) -> PathBuf {
        self.node.data_dir.join("log")
    }

    /// Get the consensus state directory path
    pub fn raft_dir(&self) -> PathBuf {
        self.node.data_dir.join("raft")
    }
}
