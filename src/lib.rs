//! Packlog - Distributed Commit Log
//!
//! A distributed, replicated, append-only record log. Records are
//! persisted in segmented store/index file pairs, replicated across
//! the cluster by a leader-based consensus protocol whose replication
//! log reuses the same on-disk format, and served to clients over a
//! streaming RPC surface that shares one TCP listener with the
//! consensus transport.
//!
//! # Architecture
//!
//! A node runs four cooperating layers: the segmented commit log, the
//! consensus runtime driving a log-backed state machine, gossip
//! membership feeding voter changes, and the RPC boundary. The first
//! byte of every inbound connection decides whether it belongs to the
//! consensus transport or to a client.

pub mod agent;
pub mod auth;
pub mod cluster;
pub mod commitlog;
pub mod config;
pub mod discovery;
pub mod distributed;
pub mod error;
pub mod net;
pub mod raft;
pub mod server;

pub use config::PacklogConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::agent::{Agent, AgentConfig};
    pub use crate::commitlog::{Log, Record};
    pub use crate::config::PacklogConfig;
    pub use crate::distributed::{ClusterServer, DistributedLog};
    pub use crate::error::{Error, Result};
    pub use crate::server::LogClient;
}
