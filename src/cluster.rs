//! Cluster Adapter
//!
//! Translates membership events into consensus configuration changes.
//! Tracks known servers by node name so replayed or reordered events
//! stay idempotent, and absorbs nothing: consensus-level errors flow
//! back to the membership layer, which decides how loudly to log them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::discovery::Handler;
use crate::distributed::DistributedLog;
use crate::error::Result;

/// Membership handler feeding the consensus configuration
pub struct ClusterHandler {
    log: Arc<DistributedLog>,
    /// Known servers, keyed by node name
    servers: Mutex<ServerMap>,
}

struct ServerMap {
    entries: HashMap<String, String>,
    closed: bool,
}

impl ClusterHandler {
    /// Create the adapter over the distributed log facade
    pub fn new(log: Arc<DistributedLog>) -> Self {
        Self {
            log,
            servers: Mutex::new(ServerMap {
                entries: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Stop forwarding events; safe to call twice
    pub async fn close(&self) {
        self.servers.lock().await.closed = true;
    }
}

#[async_trait]
impl Handler for ClusterHandler {
    async fn join(&self, name: &str, addr: &str) -> Result<()> {
        {
            let mut servers = self.servers.lock().await;
            if servers.closed {
                return Ok(());
            }
            if servers.entries.get(name).map(String::as_str) == Some(addr) {
                // Already tracked under this address
                return Ok(());
            }
            servers.entries.insert(name.to_string(), addr.to_string());
        }

        self.log.join(name, addr).await
    }

    async fn leave(&self, name: &str) -> Result<()> {
        {
            let mut servers = self.servers.lock().await;
            if servers.closed || servers.entries.remove(name).is_none() {
                return Ok(());
            }
        }

        self.log.leave(name).await
    }
}
