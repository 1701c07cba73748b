//! Consensus Node
//!
//! Single-task actor owning all consensus state. Peer messages, apply
//! requests, configuration changes, and timer events all funnel into
//! one event loop, so state transitions never race.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::net::StreamLayer;

use super::message::RaftMessage;
use super::snapshot::{SnapshotMeta, SnapshotStore};
use super::stable::StableStore;
use super::transport::{spawn_acceptor, PeerClient};
use super::{EntryKind, LogEntry, LogStore, RaftConfig, ServerInfo, StateMachine};

/// Longest entry batch per AppendEntries round
const MAX_APPEND_ENTRIES: usize = 64;

/// Node role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Cheaply readable view of the node's externally visible state
struct Shared {
    role: Role,
    term: u64,
    leader_id: Option<String>,
    leader_addr: Option<String>,
    servers: Vec<ServerInfo>,
}

/// Events handled by the node task
enum Event<O> {
    Inbound(RaftMessage, oneshot::Sender<RaftMessage>),
    Apply {
        kind: EntryKind,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<O>>,
    },
    AddVoter {
        id: String,
        addr: String,
        reply: oneshot::Sender<Result<()>>,
    },
    RemoveServer {
        id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    PeerReply {
        peer: String,
        msg: RaftMessage,
    },
    PeerFailure {
        peer: String,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running consensus node
pub struct Raft<M: StateMachine> {
    event_tx: mpsc::Sender<Event<M::Output>>,
    shared: Arc<RwLock<Shared>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<M: StateMachine> Raft<M> {
    /// Boot the consensus node: recover persisted state, restore the
    /// latest snapshot if the state machine is behind it, and spawn
    /// the event loop plus the transport acceptor.
    pub fn new(
        config: RaftConfig,
        fsm: Arc<M>,
        log: Arc<dyn LogStore>,
        stable: StableStore,
        snapshots: SnapshotStore,
        layer: Arc<StreamLayer>,
    ) -> Result<Self> {
        let term = stable.current_term()?;
        let voted_for = stable.voted_for()?;
        let mut servers = stable.configuration()?.unwrap_or_default();
        let mut last_applied = stable.last_applied()?;

        let mut snapshot_index = 0;
        let mut snapshot_term = 0;
        if let Some((meta, mut file)) = snapshots.latest()? {
            snapshot_index = meta.last_index;
            snapshot_term = meta.last_term;
            if meta.last_index > last_applied {
                fsm.restore(&mut file)?;
                last_applied = meta.last_index;
                stable.set_last_applied(last_applied)?;
            }
            if servers.is_empty() {
                servers = meta.configuration;
            }
        }

        if servers.is_empty() && config.bootstrap {
            servers = vec![ServerInfo {
                id: config.local_id.clone(),
                addr: config.local_addr.clone(),
            }];
            stable.set_configuration(&servers)?;
            tracing::info!(id = %config.local_id, "bootstrapped cluster configuration");
        }

        let shared = Arc::new(RwLock::new(Shared {
            role: Role::Follower,
            term,
            leader_id: None,
            leader_addr: None,
            servers: servers.clone(),
        }));

        let (event_tx, event_rx) = mpsc::channel(256);
        spawn_acceptor(Arc::clone(&layer), inbound_adapter(event_tx.clone()));

        let mut node = Node {
            id: config.local_id.clone(),
            config,
            fsm,
            log,
            stable,
            snapshots,
            layer,
            role: Role::Follower,
            term,
            voted_for,
            votes: HashSet::new(),
            leader_id: None,
            commit_index: last_applied,
            last_applied,
            servers,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            in_flight: HashSet::new(),
            peers: HashMap::new(),
            pending_commands: HashMap::new(),
            pending_config: HashMap::new(),
            snapshot_index,
            snapshot_term,
            commands_since_snapshot: 0,
            election_deadline: Instant::now(),
            shared: Arc::clone(&shared),
            event_tx: event_tx.clone(),
        };
        node.reset_election_deadline();
        node.publish_shared();

        let handle = tokio::spawn(node.run(event_rx));

        Ok(Self {
            event_tx,
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Submit an entry and wait for the state machine's reply once it
    /// commits. Fails with `NotLeader` on a follower.
    pub async fn apply(&self, kind: EntryKind, data: Vec<u8>) -> Result<M::Output> {
        let (tx, rx) = oneshot::channel();
        self.event_tx
            .send(Event::Apply {
                kind,
                data,
                reply: tx,
            })
            .await
            .map_err(|_| Error::ShuttingDown)?;
        rx.await.map_err(|_| Error::ShuttingDown)?
    }

    /// Add a voter to the configuration; resolves once the change
    /// commits
    pub async fn add_voter(&self, id: &str, addr: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.event_tx
            .send(Event::AddVoter {
                id: id.to_string(),
                addr: addr.to_string(),
                reply: tx,
            })
            .await
            .map_err(|_| Error::ShuttingDown)?;
        rx.await.map_err(|_| Error::ShuttingDown)?
    }

    /// Remove a server from the configuration; resolves once the
    /// change commits
    pub async fn remove_server(&self, id: &str) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.event_tx
            .send(Event::RemoveServer {
                id: id.to_string(),
                reply: tx,
            })
            .await
            .map_err(|_| Error::ShuttingDown)?;
        rx.await.map_err(|_| Error::ShuttingDown)?
    }

    /// The currently known leader, as (id, addr)
    pub fn leader(&self) -> Option<(String, String)> {
        let shared = self.shared.read();
        match (&shared.leader_id, &shared.leader_addr) {
            (Some(id), Some(addr)) => Some((id.clone(), addr.clone())),
            _ => None,
        }
    }

    /// Whether this node is the leader
    pub fn is_leader(&self) -> bool {
        self.shared.read().role == Role::Leader
    }

    /// Current cluster configuration
    pub fn servers(&self) -> Vec<ServerInfo> {
        self.shared.read().servers.clone()
    }

    /// Stop the node task; safe to call twice
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self
            .event_tx
            .send(Event::Shutdown { reply: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
        Ok(())
    }
}

/// Adapt the transport's inbound channel onto the event channel
fn inbound_adapter<O: Send + 'static>(
    event_tx: mpsc::Sender<Event<O>>,
) -> mpsc::Sender<(RaftMessage, oneshot::Sender<RaftMessage>)> {
    let (tx, mut rx) = mpsc::channel::<(RaftMessage, oneshot::Sender<RaftMessage>)>(256);
    tokio::spawn(async move {
        while let Some((msg, reply)) = rx.recv().await {
            if event_tx.send(Event::Inbound(msg, reply)).await.is_err() {
                break;
            }
        }
    });
    tx
}

/// All consensus state, owned by the event-loop task
struct Node<M: StateMachine> {
    id: String,
    config: RaftConfig,
    fsm: Arc<M>,
    log: Arc<dyn LogStore>,
    stable: StableStore,
    snapshots: SnapshotStore,
    layer: Arc<StreamLayer>,

    role: Role,
    term: u64,
    voted_for: Option<String>,
    votes: HashSet<String>,
    leader_id: Option<String>,
    commit_index: u64,
    last_applied: u64,
    servers: Vec<ServerInfo>,

    next_index: HashMap<String, u64>,
    match_index: HashMap<String, u64>,
    in_flight: HashSet<String>,
    peers: HashMap<String, Arc<PeerClient>>,

    pending_commands: HashMap<u64, oneshot::Sender<Result<M::Output>>>,
    pending_config: HashMap<u64, oneshot::Sender<Result<()>>>,

    snapshot_index: u64,
    snapshot_term: u64,
    commands_since_snapshot: u64,

    election_deadline: Instant,
    shared: Arc<RwLock<Shared>>,
    event_tx: mpsc::Sender<Event<M::Output>>,
}

impl<M: StateMachine> Node<M> {
    async fn run(mut self, mut event_rx: mpsc::Receiver<Event<M::Output>>) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let election_sleep = tokio::time::sleep_until(self.election_deadline);
            tokio::pin!(election_sleep);

            tokio::select! {
                maybe_event = event_rx.recv() => {
                    match maybe_event {
                        Some(Event::Shutdown { reply }) => {
                            self.fail_pending(|| Error::ShuttingDown);
                            let _ = reply.send(());
                            break;
                        }
                        Some(event) => self.handle_event(event),
                        None => break,
                    }
                }
                _ = &mut election_sleep, if self.role != Role::Leader => {
                    self.handle_election_timeout();
                }
                _ = heartbeat.tick(), if self.role == Role::Leader => {
                    self.replicate_all();
                }
            }
        }
        tracing::debug!(id = %self.id, "consensus node stopped");
    }

    fn handle_event(&mut self, event: Event<M::Output>) {
        match event {
            Event::Inbound(msg, reply) => {
                let response = self.handle_message(msg);
                let _ = reply.send(response);
            }
            Event::Apply { kind, data, reply } => self.handle_apply(kind, data, reply),
            Event::AddVoter { id, addr, reply } => {
                let change = self.build_add_voter(&id, &addr);
                self.handle_config_change(change, reply);
            }
            Event::RemoveServer { id, reply } => {
                let servers = self
                    .servers
                    .iter()
                    .filter(|s| s.id != id)
                    .cloned()
                    .collect::<Vec<_>>();
                self.handle_config_change(Some(servers), reply);
            }
            Event::PeerReply { peer, msg } => self.handle_peer_reply(&peer, msg),
            Event::PeerFailure { peer } => {
                self.in_flight.remove(&peer);
            }
            Event::Shutdown { .. } => unreachable!("shutdown handled in run loop"),
        }
    }

    // ========== Elections ==========

    fn reset_election_deadline(&mut self) {
        let min = self.config.election_timeout_min.as_millis() as u64;
        let max = self.config.election_timeout_max.as_millis() as u64;
        let ms = rand::thread_rng().gen_range(min..=max.max(min));
        self.election_deadline = Instant::now() + Duration::from_millis(ms);
    }

    fn is_voter(&self) -> bool {
        self.servers.iter().any(|s| s.id == self.id)
    }

    fn quorum(&self) -> usize {
        self.servers.len() / 2 + 1
    }

    fn handle_election_timeout(&mut self) {
        self.reset_election_deadline();

        if !self.is_voter() {
            // Not part of the configuration yet; wait for the leader
            return;
        }

        if let Err(e) = self.start_election() {
            tracing::error!(id = %self.id, "election failed: {}", e);
        }
    }

    fn start_election(&mut self) -> Result<()> {
        self.term += 1;
        self.role = Role::Candidate;
        self.voted_for = Some(self.id.clone());
        self.votes.clear();
        self.votes.insert(self.id.clone());
        self.leader_id = None;

        self.stable.set_current_term(self.term)?;
        self.stable.set_voted_for(Some(&self.id))?;
        self.publish_shared();

        tracing::info!(id = %self.id, term = self.term, "starting election");

        if self.votes.len() >= self.quorum() {
            self.become_leader()?;
            return Ok(());
        }

        let last_index = self.log.last_index()?;
        let last_term = self.term_at(last_index)?;
        let msg = RaftMessage::RequestVote {
            term: self.term,
            candidate_id: self.id.clone(),
            last_log_index: last_index,
            last_log_term: last_term,
        };

        for server in self.peer_ids() {
            if let Some(client) = self.client_for(&server) {
                self.spawn_call(server, client, msg.clone());
            }
        }
        Ok(())
    }

    fn become_leader(&mut self) -> Result<()> {
        tracing::info!(id = %self.id, term = self.term, "won election, becoming leader");

        self.role = Role::Leader;
        self.leader_id = Some(self.id.clone());
        self.in_flight.clear();

        let last = self.log.last_index()?;
        self.next_index.clear();
        self.match_index.clear();
        for peer in self.peer_ids() {
            self.next_index.insert(peer.clone(), last + 1);
            self.match_index.insert(peer, 0);
        }

        // Establish leadership by committing an entry of the new term
        self.append_local(EntryKind::Noop, Vec::new())?;
        self.publish_shared();
        self.replicate_all();
        self.advance_commit()?;
        Ok(())
    }

    /// Move to follower after seeing a higher term
    fn update_term(&mut self, term: u64) {
        self.term = term;
        self.voted_for = None;
        if let Err(e) = self.stable.set_current_term(term) {
            tracing::error!("failed to persist term: {}", e);
        }
        if let Err(e) = self.stable.set_voted_for(None) {
            tracing::error!("failed to persist vote: {}", e);
        }
        self.become_follower();
    }

    fn become_follower(&mut self) {
        if self.role == Role::Leader {
            tracing::info!(id = %self.id, term = self.term, "stepping down to follower");
        }
        self.role = Role::Follower;
        self.votes.clear();
        let leader = self.leader_id.clone();
        self.fail_pending(move || match &leader {
            Some(leader) => Error::NotLeader(leader.clone()),
            None => Error::NoLeader,
        });
        self.reset_election_deadline();
        self.publish_shared();
    }

    // ========== Message handling ==========

    fn handle_message(&mut self, msg: RaftMessage) -> RaftMessage {
        tracing::trace!(id = %self.id, "received {}", msg.type_name());
        match msg {
            RaftMessage::RequestVote {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => self.handle_request_vote(term, candidate_id, last_log_index, last_log_term),
            RaftMessage::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => self.handle_append_entries(
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            ),
            RaftMessage::InstallSnapshot {
                term,
                leader_id,
                last_index,
                last_term,
                configuration,
                data,
            } => self.handle_install_snapshot(
                term,
                leader_id,
                last_index,
                last_term,
                configuration,
                data,
            ),
            // Responses arriving on the server side of a connection
            // are protocol violations; answer with our current term.
            other => {
                tracing::debug!("unexpected inbound {}", other.type_name());
                RaftMessage::AppendEntriesResponse {
                    term: self.term,
                    follower_id: self.id.clone(),
                    success: false,
                    match_index: 0,
                }
            }
        }
    }

    fn handle_request_vote(
        &mut self,
        term: u64,
        candidate_id: String,
        last_log_index: u64,
        last_log_term: u64,
    ) -> RaftMessage {
        if term > self.term {
            self.update_term(term);
        }

        let mut granted = false;
        if term == self.term {
            let can_vote = match &self.voted_for {
                None => true,
                Some(id) => *id == candidate_id,
            };

            let (our_index, our_term) = self.last_log_position();
            let log_ok = last_log_term > our_term
                || (last_log_term == our_term && last_log_index >= our_index);

            if can_vote && log_ok {
                granted = true;
                self.voted_for = Some(candidate_id.clone());
                if let Err(e) = self.stable.set_voted_for(Some(&candidate_id)) {
                    tracing::error!("failed to persist vote: {}", e);
                }
                self.reset_election_deadline();
                tracing::info!(id = %self.id, term, candidate = %candidate_id, "granted vote");
            }
        }

        RaftMessage::RequestVoteResponse {
            term: self.term,
            voter_id: self.id.clone(),
            vote_granted: granted,
        }
    }

    fn handle_append_entries(
        &mut self,
        term: u64,
        leader_id: String,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> RaftMessage {
        if term < self.term {
            return self.append_response(false, 0);
        }

        if term > self.term {
            self.update_term(term);
        } else if self.role != Role::Follower {
            self.become_follower();
        }

        self.leader_id = Some(leader_id);
        self.reset_election_deadline();
        self.publish_shared();

        let mut last = match self.log.last_index() {
            Ok(last) => last,
            Err(e) => {
                tracing::error!("log unavailable: {}", e);
                return self.append_response(false, 0);
            }
        };

        // Consistency check on the entry preceding the batch
        if prev_log_index > 0 && prev_log_index > self.snapshot_index {
            if prev_log_index > last {
                return self.append_response(false, last);
            }
            match self.term_at(prev_log_index) {
                Ok(t) if t == prev_log_term => {}
                Ok(_) | Err(_) => {
                    return self.append_response(false, prev_log_index.saturating_sub(1));
                }
            }
        }

        for entry in entries {
            if entry.index <= self.snapshot_index {
                continue;
            }
            if entry.index <= last {
                match self.term_at(entry.index) {
                    Ok(t) if t == entry.term => continue,
                    _ => {
                        // Divergent uncommitted suffix; the store only
                        // truncates prefixes, so refuse the append.
                        tracing::error!(
                            index = entry.index,
                            "conflicting entry term, rejecting append"
                        );
                        return self.append_response(false, entry.index.saturating_sub(1));
                    }
                }
            }

            if let Err(e) = self.log.append(std::slice::from_ref(&entry)) {
                tracing::error!(index = entry.index, "failed to store entry: {}", e);
                return self.append_response(false, last);
            }
            last = entry.index;

            if entry.kind == EntryKind::Configuration {
                match bincode::deserialize::<Vec<ServerInfo>>(&entry.data) {
                    Ok(servers) => self.adopt_configuration(servers),
                    Err(e) => tracing::error!("bad configuration entry: {}", e),
                }
            }
        }

        if leader_commit > self.commit_index {
            self.commit_index = leader_commit.min(last);
            if let Err(e) = self.apply_committed() {
                tracing::error!("apply failed: {}", e);
            }
        }

        self.append_response(true, last)
    }

    fn append_response(&self, success: bool, match_index: u64) -> RaftMessage {
        RaftMessage::AppendEntriesResponse {
            term: self.term,
            follower_id: self.id.clone(),
            success,
            match_index,
        }
    }

    fn handle_install_snapshot(
        &mut self,
        term: u64,
        leader_id: String,
        last_index: u64,
        last_term: u64,
        configuration: Vec<ServerInfo>,
        data: Vec<u8>,
    ) -> RaftMessage {
        if term < self.term {
            return RaftMessage::InstallSnapshotResponse {
                term: self.term,
                success: false,
            };
        }
        if term > self.term {
            self.update_term(term);
        }
        self.leader_id = Some(leader_id);
        self.reset_election_deadline();

        let result = (|| -> Result<()> {
            self.fsm.restore(&mut &data[..])?;
            self.log.reset(last_index + 1)?;

            let meta = SnapshotMeta {
                last_index,
                last_term,
                configuration: configuration.clone(),
            };
            self.snapshots.save(&meta, &mut &data[..])?;

            self.snapshot_index = last_index;
            self.snapshot_term = last_term;
            self.commit_index = last_index;
            self.last_applied = last_index;
            self.stable.set_last_applied(last_index)?;
            self.adopt_configuration(configuration);
            Ok(())
        })();

        match result {
            Ok(()) => {
                tracing::info!(id = %self.id, last_index, "installed snapshot");
                RaftMessage::InstallSnapshotResponse {
                    term: self.term,
                    success: true,
                }
            }
            Err(e) => {
                tracing::error!("snapshot install failed: {}", e);
                RaftMessage::InstallSnapshotResponse {
                    term: self.term,
                    success: false,
                }
            }
        }
    }

    fn handle_peer_reply(&mut self, peer: &str, msg: RaftMessage) {
        if msg.term() > self.term {
            self.update_term(msg.term());
            self.in_flight.remove(peer);
            return;
        }

        match msg {
            RaftMessage::RequestVoteResponse {
                term,
                voter_id,
                vote_granted,
            } => {
                if self.role == Role::Candidate && term == self.term && vote_granted {
                    self.votes.insert(voter_id);
                    if self.votes.len() >= self.quorum() {
                        if let Err(e) = self.become_leader() {
                            tracing::error!("failed to assume leadership: {}", e);
                        }
                    }
                }
            }
            RaftMessage::AppendEntriesResponse {
                term,
                follower_id,
                success,
                match_index,
            } => {
                self.in_flight.remove(&follower_id);
                if self.role != Role::Leader || term != self.term {
                    return;
                }

                if success {
                    self.match_index.insert(follower_id.clone(), match_index);
                    self.next_index.insert(follower_id.clone(), match_index + 1);
                    if let Err(e) = self.advance_commit() {
                        tracing::error!("commit advance failed: {}", e);
                    }

                    let last = self.log.last_index().unwrap_or(0);
                    if match_index < last {
                        self.replicate_peer(&follower_id);
                    }
                } else {
                    let next = self
                        .next_index
                        .get(&follower_id)
                        .copied()
                        .unwrap_or(1)
                        .saturating_sub(1)
                        .min(match_index + 1)
                        .max(1);
                    self.next_index.insert(follower_id.clone(), next);
                    self.replicate_peer(&follower_id);
                }
            }
            RaftMessage::InstallSnapshotResponse { term, success } => {
                self.in_flight.remove(peer);
                if self.role != Role::Leader || term != self.term {
                    return;
                }
                if success {
                    self.match_index.insert(peer.to_string(), self.snapshot_index);
                    self.next_index
                        .insert(peer.to_string(), self.snapshot_index + 1);
                    self.replicate_peer(peer);
                }
            }
            other => {
                tracing::debug!("unexpected peer reply {}", other.type_name());
                self.in_flight.remove(peer);
            }
        }
    }

    // ========== Leader replication ==========

    fn handle_apply(&mut self, kind: EntryKind, data: Vec<u8>, reply: oneshot::Sender<Result<M::Output>>) {
        if self.role != Role::Leader {
            let _ = reply.send(Err(self.not_leader()));
            return;
        }

        match self.append_local(kind, data) {
            Ok(index) => {
                if kind == EntryKind::Command {
                    self.pending_commands.insert(index, reply);
                } else {
                    // Nothing to hand back for non-command entries
                    drop(reply);
                }
                self.replicate_all();
                if let Err(e) = self.advance_commit() {
                    tracing::error!("commit advance failed: {}", e);
                }
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn build_add_voter(&self, id: &str, addr: &str) -> Option<Vec<ServerInfo>> {
        let exists = self
            .servers
            .iter()
            .any(|s| s.id == id && s.addr == addr);
        if exists {
            return None;
        }

        let mut servers: Vec<ServerInfo> = self
            .servers
            .iter()
            .filter(|s| s.id != id && s.addr != addr)
            .cloned()
            .collect();
        servers.push(ServerInfo {
            id: id.to_string(),
            addr: addr.to_string(),
        });
        Some(servers)
    }

    fn handle_config_change(
        &mut self,
        servers: Option<Vec<ServerInfo>>,
        reply: oneshot::Sender<Result<()>>,
    ) {
        if self.role != Role::Leader {
            let _ = reply.send(Err(self.not_leader()));
            return;
        }

        // Idempotent change: already the active configuration
        let Some(servers) = servers else {
            let _ = reply.send(Ok(()));
            return;
        };
        if servers == self.servers {
            let _ = reply.send(Ok(()));
            return;
        }

        let data = match bincode::serialize(&servers) {
            Ok(data) => data,
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                return;
            }
        };

        match self.append_local(EntryKind::Configuration, data) {
            Ok(index) => {
                // The leader adopts configuration changes on append
                self.adopt_configuration(servers);
                self.pending_config.insert(index, reply);
                self.replicate_all();
                if let Err(e) = self.advance_commit() {
                    tracing::error!("commit advance failed: {}", e);
                }
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn append_local(&mut self, kind: EntryKind, data: Vec<u8>) -> Result<u64> {
        let index = self.log.last_index()?.max(self.snapshot_index) + 1;
        let entry = LogEntry {
            index,
            term: self.term,
            kind,
            data,
        };
        self.log.append(std::slice::from_ref(&entry))?;
        Ok(index)
    }

    fn replicate_all(&mut self) {
        for peer in self.peer_ids() {
            self.replicate_peer(&peer);
        }
    }

    fn replicate_peer(&mut self, peer_id: &str) {
        if self.role != Role::Leader || self.in_flight.contains(peer_id) {
            return;
        }
        let Some(client) = self.client_for(peer_id) else {
            return;
        };

        let msg = match self.build_replication_message(peer_id) {
            Ok(Some(msg)) => msg,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(peer = peer_id, "failed to build replication batch: {}", e);
                return;
            }
        };

        self.in_flight.insert(peer_id.to_string());
        self.spawn_call(peer_id.to_string(), client, msg);
    }

    fn build_replication_message(&mut self, peer_id: &str) -> Result<Option<RaftMessage>> {
        let last = self.log.last_index()?;
        let next = self
            .next_index
            .get(peer_id)
            .copied()
            .unwrap_or(last + 1)
            .max(1);

        if next <= self.snapshot_index {
            let Some((meta, mut file)) = self.snapshots.latest()? else {
                return Ok(None);
            };
            let mut data = Vec::new();
            file.read_to_end(&mut data)?;
            return Ok(Some(RaftMessage::InstallSnapshot {
                term: self.term,
                leader_id: self.id.clone(),
                last_index: meta.last_index,
                last_term: meta.last_term,
                configuration: meta.configuration,
                data,
            }));
        }

        let prev = next - 1;
        let prev_term = self.term_at(prev)?;

        let mut entries = Vec::new();
        if next <= last {
            let upper = last.min(next + MAX_APPEND_ENTRIES as u64 - 1);
            for index in next..=upper {
                entries.push(self.log.entry(index)?);
            }
        }

        Ok(Some(RaftMessage::AppendEntries {
            term: self.term,
            leader_id: self.id.clone(),
            prev_log_index: prev,
            prev_log_term: prev_term,
            entries,
            leader_commit: self.commit_index,
        }))
    }

    fn advance_commit(&mut self) -> Result<()> {
        if self.role != Role::Leader {
            return Ok(());
        }

        let last = self.log.last_index()?;
        let mut matches: Vec<u64> = self
            .servers
            .iter()
            .filter(|s| s.id != self.id)
            .map(|s| self.match_index.get(&s.id).copied().unwrap_or(0))
            .collect();
        if self.is_voter() {
            matches.push(last);
        }

        let quorum = self.quorum();
        if matches.len() < quorum {
            return Ok(());
        }
        matches.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matches[quorum - 1];

        if candidate > self.commit_index && self.term_at(candidate)? == self.term {
            self.commit_index = candidate;
            self.apply_committed()?;
        }
        Ok(())
    }

    // ========== Applying committed entries ==========

    fn apply_committed(&mut self) -> Result<()> {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let entry = self.log.entry(index)?;

            match entry.kind {
                EntryKind::Command => {
                    let output = self.fsm.apply(&entry);
                    if let Some(reply) = self.pending_commands.remove(&index) {
                        let _ = reply.send(Ok(output));
                    }
                    self.commands_since_snapshot += 1;
                }
                EntryKind::Configuration => {
                    if let Some(reply) = self.pending_config.remove(&index) {
                        let _ = reply.send(Ok(()));
                    }
                    // A leader that removed itself steps down only
                    // after the removal commits
                    if self.role == Role::Leader && !self.is_voter() {
                        self.become_follower();
                    }
                }
                EntryKind::Noop => {}
            }

            self.last_applied = index;
            self.stable.set_last_applied(index)?;
        }

        self.maybe_snapshot()
    }

    fn maybe_snapshot(&mut self) -> Result<()> {
        let threshold = self.config.snapshot_threshold;
        if threshold == 0 || self.commands_since_snapshot < threshold {
            return Ok(());
        }

        let last_term = self.term_at(self.last_applied)?;
        let meta = SnapshotMeta {
            last_index: self.last_applied,
            last_term,
            configuration: self.servers.clone(),
        };

        let mut reader = self.fsm.snapshot()?;
        self.snapshots.save(&meta, reader.as_mut())?;

        self.snapshot_index = self.last_applied;
        self.snapshot_term = last_term;
        self.commands_since_snapshot = 0;

        let first = self.log.first_index()?;
        self.log.delete_range(first, self.last_applied)?;
        Ok(())
    }

    // ========== Helpers ==========

    fn adopt_configuration(&mut self, servers: Vec<ServerInfo>) {
        if let Err(e) = self.stable.set_configuration(&servers) {
            tracing::error!("failed to persist configuration: {}", e);
        }
        self.servers = servers;

        let ids: HashSet<String> = self.servers.iter().map(|s| s.id.clone()).collect();
        self.next_index.retain(|id, _| ids.contains(id));
        self.match_index.retain(|id, _| ids.contains(id));
        self.peers.retain(|id, _| ids.contains(id));

        if self.role == Role::Leader {
            let last = self.log.last_index().unwrap_or(0);
            for peer in self.peer_ids() {
                self.next_index.entry(peer.clone()).or_insert(last + 1);
                self.match_index.entry(peer).or_insert(0);
            }
        }
        self.publish_shared();
    }

    fn peer_ids(&self) -> Vec<String> {
        self.servers
            .iter()
            .filter(|s| s.id != self.id)
            .map(|s| s.id.clone())
            .collect()
    }

    fn client_for(&mut self, peer_id: &str) -> Option<Arc<PeerClient>> {
        let addr = self
            .servers
            .iter()
            .find(|s| s.id == peer_id)
            .map(|s| s.addr.clone())?;

        match self.peers.get(peer_id) {
            Some(client) if client.addr() == addr => Some(Arc::clone(client)),
            _ => {
                let client = Arc::new(PeerClient::new(
                    addr,
                    Arc::clone(&self.layer),
                    self.config.rpc_timeout,
                ));
                self.peers.insert(peer_id.to_string(), Arc::clone(&client));
                Some(client)
            }
        }
    }

    fn spawn_call(&self, peer: String, client: Arc<PeerClient>, msg: RaftMessage) {
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            match client.call(&msg).await {
                Ok(resp) => {
                    let _ = event_tx.send(Event::PeerReply { peer, msg: resp }).await;
                }
                Err(e) => {
                    tracing::trace!(peer = %peer, "peer call failed: {}", e);
                    let _ = event_tx.send(Event::PeerFailure { peer }).await;
                }
            }
        });
    }

    fn last_log_position(&self) -> (u64, u64) {
        let index = self.log.last_index().unwrap_or(0).max(self.snapshot_index);
        let term = self.term_at(index).unwrap_or(0);
        (index, term)
    }

    fn term_at(&self, index: u64) -> Result<u64> {
        if index == 0 {
            return Ok(0);
        }
        if index == self.snapshot_index {
            return Ok(self.snapshot_term);
        }
        Ok(self.log.entry(index)?.term)
    }

    fn not_leader(&self) -> Error {
        match &self.leader_id {
            Some(leader) if *leader != self.id => Error::NotLeader(leader.clone()),
            _ => Error::NoLeader,
        }
    }

    fn fail_pending(&mut self, err: impl Fn() -> Error) {
        for (_, reply) in self.pending_commands.drain() {
            let _ = reply.send(Err(err()));
        }
        for (_, reply) in self.pending_config.drain() {
            let _ = reply.send(Err(err()));
        }
    }

    fn publish_shared(&self) {
        let leader_addr = self.leader_id.as_ref().and_then(|id| {
            self.servers
                .iter()
                .find(|s| s.id == *id)
                .map(|s| s.addr.clone())
        });

        let mut shared = self.shared.write();
        shared.role = self.role;
        shared.term = self.term;
        shared.leader_id = self.leader_id.clone();
        shared.leader_addr = leader_addr;
        shared.servers = self.servers.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::ListenerMux;
    use parking_lot::Mutex as PlMutex;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::watch;

    /// In-memory state machine collecting applied payloads
    struct TestFsm {
        applied: PlMutex<Vec<Vec<u8>>>,
    }

    impl TestFsm {
        fn new() -> Self {
            Self {
                applied: PlMutex::new(Vec::new()),
            }
        }

        fn applied(&self) -> Vec<Vec<u8>> {
            self.applied.lock().clone()
        }
    }

    impl StateMachine for TestFsm {
        type Output = usize;

        fn apply(&self, entry: &LogEntry) -> usize {
            let mut applied = self.applied.lock();
            applied.push(entry.data.clone());
            applied.len()
        }

        fn snapshot(&self) -> Result<Box<dyn Read + Send>> {
            let bytes = bincode::serialize(&*self.applied.lock())?;
            Ok(Box::new(std::io::Cursor::new(bytes)))
        }

        fn restore(&self, reader: &mut dyn Read) -> Result<()> {
            let mut bytes = Vec::new();
            reader.read_to_end(&mut bytes)?;
            *self.applied.lock() = bincode::deserialize(&bytes)?;
            Ok(())
        }
    }

    /// In-memory replication log store
    struct MemLogStore {
        entries: PlMutex<Vec<LogEntry>>,
    }

    impl MemLogStore {
        fn new() -> Self {
            Self {
                entries: PlMutex::new(Vec::new()),
            }
        }
    }

    impl LogStore for MemLogStore {
        fn first_index(&self) -> Result<u64> {
            Ok(self.entries.lock().first().map_or(1, |e| e.index))
        }

        fn last_index(&self) -> Result<u64> {
            Ok(self.entries.lock().last().map_or(0, |e| e.index))
        }

        fn entry(&self, index: u64) -> Result<LogEntry> {
            self.entries
                .lock()
                .iter()
                .find(|e| e.index == index)
                .cloned()
                .ok_or(Error::OffsetOutOfRange(index))
        }

        fn append(&self, new: &[LogEntry]) -> Result<()> {
            self.entries.lock().extend_from_slice(new);
            Ok(())
        }

        fn delete_range(&self, _min: u64, max: u64) -> Result<()> {
            self.entries.lock().retain(|e| e.index > max);
            Ok(())
        }

        fn reset(&self, _next_index: u64) -> Result<()> {
            self.entries.lock().clear();
            Ok(())
        }
    }

    struct TestNode {
        raft: Raft<TestFsm>,
        fsm: Arc<TestFsm>,
        addr: String,
        _dir: TempDir,
        _shutdown: watch::Sender<bool>,
    }

    async fn start_node(id: &str, bootstrap: bool) -> TestNode {
        start_node_with_threshold(id, bootstrap, 0).await
    }

    async fn start_node_with_threshold(
        id: &str,
        bootstrap: bool,
        snapshot_threshold: u64,
    ) -> TestNode {
        let dir = tempfile::tempdir().unwrap();
        let mux = ListenerMux::bind("127.0.0.1:0").await.unwrap();
        let addr = mux.local_addr().unwrap().to_string();
        let shutdown = mux.shutdown_handle();
        let (consensus_rx, _rpc_rx) = mux.serve();

        let layer = Arc::new(StreamLayer::new(
            consensus_rx,
            shutdown.clone(),
            None,
            None,
        ));

        let config = RaftConfig {
            local_id: id.to_string(),
            local_addr: addr.clone(),
            bootstrap,
            heartbeat_interval: Duration::from_millis(50),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            snapshot_threshold,
            rpc_timeout: Duration::from_secs(2),
        };

        let fsm = Arc::new(TestFsm::new());
        let raft = Raft::new(
            config,
            Arc::clone(&fsm),
            Arc::new(MemLogStore::new()),
            StableStore::open(&dir.path().join("stable")).unwrap(),
            SnapshotStore::open(&dir.path().join("snapshots")).unwrap(),
            layer,
        )
        .unwrap();

        TestNode {
            raft,
            fsm,
            addr,
            _dir: dir,
            _shutdown: shutdown,
        }
    }

    async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test]
    async fn test_single_node_elects_and_applies() {
        let node = start_node("node-1", true).await;

        wait_until("leadership", || node.raft.is_leader()).await;

        let count = node
            .raft
            .apply(EntryKind::Command, b"hello".to_vec())
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(node.fsm.applied(), vec![b"hello".to_vec()]);
    }

    #[tokio::test]
    async fn test_follower_rejects_apply() {
        let node = start_node("node-1", false).await;

        let result = node.raft.apply(EntryKind::Command, b"nope".to_vec()).await;
        assert!(matches!(
            result,
            Err(Error::NoLeader) | Err(Error::NotLeader(_))
        ));
    }

    #[tokio::test]
    async fn test_three_node_replication() {
        let leader = start_node("node-1", true).await;
        let follower_2 = start_node("node-2", false).await;
        let follower_3 = start_node("node-3", false).await;

        wait_until("leadership", || leader.raft.is_leader()).await;

        leader
            .raft
            .add_voter("node-2", &follower_2.addr)
            .await
            .unwrap();
        leader
            .raft
            .add_voter("node-3", &follower_3.addr)
            .await
            .unwrap();

        for payload in [b"first".as_slice(), b"second", b"third"] {
            leader
                .raft
                .apply(EntryKind::Command, payload.to_vec())
                .await
                .unwrap();
        }

        let expected: Vec<Vec<u8>> =
            vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()];
        let check = expected.clone();
        wait_until("replication to node-2", || follower_2.fsm.applied() == check).await;
        let check = expected.clone();
        wait_until("replication to node-3", || follower_3.fsm.applied() == check).await;

        // Followers know the leader
        wait_until("leader discovery", || {
            follower_2.raft.leader().map(|(id, _)| id) == Some("node-1".to_string())
        })
        .await;

        leader.raft.shutdown().await.unwrap();
        follower_2.raft.shutdown().await.unwrap();
        follower_3.raft.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_taken_after_threshold() {
        let node = start_node_with_threshold("node-1", true, 2).await;
        wait_until("leadership", || node.raft.is_leader()).await;

        for payload in [b"a".as_slice(), b"b", b"c"] {
            node.raft
                .apply(EntryKind::Command, payload.to_vec())
                .await
                .unwrap();
        }

        let snapshot_dir = node._dir.path().join("snapshots");
        let snapshots = SnapshotStore::open(&snapshot_dir).unwrap();
        let meta = snapshots.latest_meta().unwrap().expect("snapshot exists");
        assert!(meta.last_index >= 2);

        // The state machine keeps serving applies after compaction
        let count = node
            .raft
            .apply(EntryKind::Command, b"d".to_vec())
            .await
            .unwrap();
        assert_eq!(count, 4);
    }

    #[tokio::test]
    async fn test_remove_server() {
        let leader = start_node("node-1", true).await;
        let follower = start_node("node-2", false).await;

        wait_until("leadership", || leader.raft.is_leader()).await;
        leader
            .raft
            .add_voter("node-2", &follower.addr)
            .await
            .unwrap();
        assert_eq!(leader.raft.servers().len(), 2);

        leader.raft.remove_server("node-2").await.unwrap();
        assert_eq!(leader.raft.servers().len(), 1);

        leader.raft.shutdown().await.unwrap();
        follower.raft.shutdown().await.unwrap();
    }
}
