//! Cluster Membership
//!
//! Gossip-based discovery over UDP. Every node periodically announces
//! itself and its member view to its seeds and known peers; announces
//! piggyback the full member list so discovery is transitive. A member
//! that stops announcing past the failure timeout is treated as
//! failed. Join and leave events are delivered to a handler, filtered
//! to exclude the local node.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Announce cadence
const GOSSIP_INTERVAL: Duration = Duration::from_millis(1000);

/// Silence after which a member is considered failed
const FAILURE_TIMEOUT: Duration = Duration::from_millis(5000);

/// Largest accepted gossip datagram
const MAX_DATAGRAM: usize = 64 * 1024;

/// Tag under which a member advertises its RPC address
pub const RPC_ADDR_TAG: &str = "rpc_addr";

/// Receiver of membership events
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// A member joined, reachable for RPC at `addr`
    async fn join(&self, name: &str, addr: &str) -> Result<()>;

    /// A member left or failed
    async fn leave(&self, name: &str) -> Result<()>;
}

/// Membership configuration
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    /// Unique name for the node
    pub node_name: String,
    /// Address to bind for gossip communication
    pub bind_addr: String,
    /// Metadata tags for the node
    pub tags: HashMap<String, String>,
    /// Addresses of existing members to join
    pub start_join_addrs: Vec<String>,
}

/// A cluster member as seen by gossip
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Node name
    pub name: String,
    /// Gossip address
    pub addr: String,
    /// Metadata tags
    pub tags: HashMap<String, String>,
}

impl Member {
    /// The member's advertised RPC address
    pub fn rpc_addr(&self) -> &str {
        self.tags.get(RPC_ADDR_TAG).map(String::as_str).unwrap_or("")
    }
}

/// Gossip datagrams
#[derive(Debug, Serialize, Deserialize)]
enum GossipMessage {
    /// Periodic presence announcement with the sender's member view
    Announce { from: Member, members: Vec<Member> },
    /// Deliberate departure
    Leave { name: String },
}

struct MemberState {
    member: Member,
    last_seen: Instant,
    joined_at: DateTime<Utc>,
}

/// Gossip membership agent
pub struct Membership {
    local: Member,
    members: Arc<RwLock<HashMap<String, MemberState>>>,
    socket: Arc<UdpSocket>,
    shutdown: watch::Sender<bool>,
}

impl Membership {
    /// Start the gossip agent and begin joining the seed addresses
    pub async fn new(handler: Arc<dyn Handler>, config: MembershipConfig) -> Result<Self> {
        let socket = Arc::new(UdpSocket::bind(&config.bind_addr).await.map_err(|e| {
            Error::Network(format!("failed to bind gossip socket {}: {}", config.bind_addr, e))
        })?);

        let local = Member {
            name: config.node_name.clone(),
            addr: socket.local_addr()?.to_string(),
            tags: config.tags.clone(),
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let members = Arc::new(RwLock::new(HashMap::new()));

        let membership = Self {
            local: local.clone(),
            members: Arc::clone(&members),
            socket: Arc::clone(&socket),
            shutdown,
        };

        tokio::spawn(gossip_loop(
            local,
            config.start_join_addrs,
            members,
            socket,
            handler,
            shutdown_rx,
        ));

        Ok(membership)
    }

    /// Current member view, including the local node
    pub fn members(&self) -> Vec<Member> {
        let mut all = vec![self.local.clone()];
        all.extend(self.members.read().values().map(|s| s.member.clone()));
        all
    }

    /// Announce this node's departure and stop gossiping
    pub async fn leave(&self) -> Result<()> {
        if *self.shutdown.borrow() {
            return Ok(());
        }

        let msg = GossipMessage::Leave {
            name: self.local.name.clone(),
        };
        let bytes = bincode::serialize(&msg)?;
        let targets: Vec<String> = self
            .members
            .read()
            .values()
            .map(|s| s.member.addr.clone())
            .collect();
        for target in targets {
            if let Err(e) = self.socket.send_to(&bytes, &target).await {
                tracing::debug!(target = %target, "leave announce failed: {}", e);
            }
        }

        let _ = self.shutdown.send(true);
        Ok(())
    }
}

/// The gossip task: announce on a timer, process datagrams, sweep for
/// failed members
async fn gossip_loop(
    local: Member,
    seeds: Vec<String>,
    members: Arc<RwLock<HashMap<String, MemberState>>>,
    socket: Arc<UdpSocket>,
    handler: Arc<dyn Handler>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut announce = tokio::time::interval(GOSSIP_INTERVAL);
    announce.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = announce.tick() => {
                send_announcements(&local, &seeds, &members, &socket).await;
                sweep_failures(&members, &handler).await;
            }
            result = socket.recv_from(&mut buf) => {
                let Ok((n, _)) = result else { continue };
                let Ok(msg) = bincode::deserialize::<GossipMessage>(&buf[..n]) else {
                    tracing::trace!("discarding malformed gossip datagram");
                    continue;
                };
                handle_gossip(&local, msg, &members, &handler).await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!(node = %local.name, "membership stopped");
}

async fn send_announcements(
    local: &Member,
    seeds: &[String],
    members: &Arc<RwLock<HashMap<String, MemberState>>>,
    socket: &UdpSocket,
) {
    let (view, targets) = {
        let members = members.read();
        let view: Vec<Member> = members.values().map(|s| s.member.clone()).collect();
        let mut targets: Vec<String> = members.values().map(|s| s.member.addr.clone()).collect();
        for seed in seeds {
            if !targets.contains(seed) {
                targets.push(seed.clone());
            }
        }
        (view, targets)
    };

    let msg = GossipMessage::Announce {
        from: local.clone(),
        members: view,
    };
    let Ok(bytes) = bincode::serialize(&msg) else {
        return;
    };

    for target in targets {
        if target == local.addr {
            continue;
        }
        if let Err(e) = socket.send_to(&bytes, &target).await {
            tracing::trace!(target = %target, "announce failed: {}", e);
        }
    }
}

async fn handle_gossip(
    local: &Member,
    msg: GossipMessage,
    members: &Arc<RwLock<HashMap<String, MemberState>>>,
    handler: &Arc<dyn Handler>,
) {
    match msg {
        GossipMessage::Announce { from, members: view } => {
            let mut joined = Vec::new();
            {
                let mut members = members.write();
                for member in view.into_iter().chain(std::iter::once(from.clone())) {
                    if member.name == local.name {
                        continue;
                    }
                    match members.get_mut(&member.name) {
                        Some(state) => {
                            if member.name == from.name {
                                state.last_seen = Instant::now();
                                state.member = member;
                            }
                        }
                        None => {
                            joined.push(member.clone());
                            members.insert(
                                member.name.clone(),
                                MemberState {
                                    member,
                                    last_seen: Instant::now(),
                                    joined_at: Utc::now(),
                                },
                            );
                        }
                    }
                }
            }

            for member in joined {
                tracing::info!(name = %member.name, rpc_addr = %member.rpc_addr(), "member joined");
                if let Err(e) = handler.join(&member.name, member.rpc_addr()).await {
                    log_handler_error(&e, "failed to join", &member.name);
                }
            }
        }
        GossipMessage::Leave { name } => {
            if name == local.name {
                return;
            }
            let removed = members.write().remove(&name).is_some();
            if removed {
                tracing::info!(name = %name, "member left");
                if let Err(e) = handler.leave(&name).await {
                    log_handler_error(&e, "failed to leave", &name);
                }
            }
        }
    }
}

async fn sweep_failures(
    members: &Arc<RwLock<HashMap<String, MemberState>>>,
    handler: &Arc<dyn Handler>,
) {
    let failed: Vec<String> = {
        let mut members = members.write();
        let now = Instant::now();
        let failed: Vec<String> = members
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_seen) > FAILURE_TIMEOUT)
            .map(|(name, s)| {
                tracing::warn!(
                    name = %name,
                    joined_at = %s.joined_at,
                    "member failed"
                );
                name.clone()
            })
            .collect();
        for name in &failed {
            members.remove(name);
        }
        failed
    };

    for name in failed {
        if let Err(e) = handler.leave(&name).await {
            log_handler_error(&e, "failed to leave", &name);
        }
    }
}

/// Non-leaders cannot act on membership events; keep their errors at
/// debug so every event does not spam the error log
fn log_handler_error(err: &Error, msg: &str, name: &str) {
    if err.is_not_leader() {
        tracing::debug!(name = %name, "{}: {}", msg, err);
    } else {
        tracing::error!(name = %name, "{}: {}", msg, err);
    }
}
