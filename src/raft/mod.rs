//! Consensus Runtime
//!
//! Leader-based log replication: randomized elections, term and vote
//! persistence, AppendEntries replication with per-peer progress
//! tracking, quorum commit, and snapshot install for lagging peers.
//!
//! The runtime is generic over three seams supplied by the caller: the
//! state machine that applies committed entries, the ordered store
//! holding the replication log, and the stable store persisting term,
//! vote, and configuration across restarts.

pub mod message;
mod node;
mod snapshot;
mod stable;
mod transport;

pub use node::Raft;
pub use snapshot::{SnapshotMeta, SnapshotStore};
pub use stable::StableStore;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Kind discriminator for replication log entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// A state-machine command
    Command,
    /// A cluster configuration change
    Configuration,
    /// A leadership no-op
    Noop,
}

impl EntryKind {
    /// Numeric form stored in the replication log
    pub fn as_u32(self) -> u32 {
        match self {
            EntryKind::Command => 0,
            EntryKind::Configuration => 1,
            EntryKind::Noop => 2,
        }
    }

    /// Decode the numeric form
    pub fn from_u32(v: u32) -> Result<Self> {
        match v {
            0 => Ok(EntryKind::Command),
            1 => Ok(EntryKind::Configuration),
            2 => Ok(EntryKind::Noop),
            other => Err(Error::State(format!("unknown entry kind: {}", other))),
        }
    }
}

/// A single replication log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the replication log
    pub index: u64,
    /// Term under which the entry was created
    pub term: u64,
    /// Entry kind
    pub kind: EntryKind,
    /// Entry payload
    pub data: Vec<u8>,
}

/// A voter in the cluster configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Node name
    pub id: String,
    /// RPC address peers dial
    pub addr: String,
}

/// State machine driven by committed entries
pub trait StateMachine: Send + Sync + 'static {
    /// Reply type handed back to the caller that submitted the entry
    type Output: Send + 'static;

    /// Apply a committed entry
    fn apply(&self, entry: &LogEntry) -> Self::Output;

    /// Frozen byte stream of the state machine's current state
    fn snapshot(&self) -> Result<Box<dyn std::io::Read + Send>>;

    /// Replace the state machine's state from a snapshot stream
    fn restore(&self, reader: &mut dyn std::io::Read) -> Result<()>;
}

/// Ordered store for replication log entries
pub trait LogStore: Send + Sync + 'static {
    /// Index of the earliest stored entry
    fn first_index(&self) -> Result<u64>;

    /// Index of the latest stored entry (0 when empty)
    fn last_index(&self) -> Result<u64>;

    /// Fetch the entry at `index`
    fn entry(&self, index: u64) -> Result<LogEntry>;

    /// Append entries in order; each entry's index must be the next
    /// position in the store
    fn append(&self, entries: &[LogEntry]) -> Result<()>;

    /// Drop the stored prefix covering `[min, max]`
    fn delete_range(&self, min: u64, max: u64) -> Result<()>;

    /// Discard everything and restart the store at `next_index`
    fn reset(&self, next_index: u64) -> Result<()>;
}

/// Consensus runtime configuration
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This node's id
    pub local_id: String,
    /// Address peers use to reach this node
    pub local_addr: String,
    /// Seed the configuration with this node as the sole voter
    pub bootstrap: bool,
    /// Leader heartbeat interval
    pub heartbeat_interval: Duration,
    /// Minimum randomized election timeout
    pub election_timeout_min: Duration,
    /// Maximum randomized election timeout
    pub election_timeout_max: Duration,
    /// Applied commands between snapshots (0 disables)
    pub snapshot_threshold: u64,
    /// Per-request transport timeout
    pub rpc_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            local_id: String::new(),
            local_addr: String::new(),
            bootstrap: false,
            heartbeat_interval: Duration::from_millis(150),
            election_timeout_min: Duration::from_millis(1000),
            election_timeout_max: Duration::from_millis(1500),
            snapshot_threshold: 8192,
            rpc_timeout: Duration::from_secs(10),
        }
    }
}
