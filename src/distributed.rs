//! Distributed Log
//!
//! Public facade over the replicated log. Appends are serialized into
//! a request envelope and submitted to the consensus runtime; reads go
//! straight to the local log. The same segmented log type backs both
//! the user data and the consensus replication log, at different
//! directories.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::commitlog::{Log, Record};
use crate::config::{ConsensusConfig, SegmentConfig};
use crate::error::{Error, Result};
use crate::net::StreamLayer;
use crate::raft::{
    EntryKind, LogEntry, LogStore, Raft, RaftConfig, ServerInfo, SnapshotStore, StableStore,
    StateMachine,
};

/// Request-type byte for append submissions
const APPEND_REQUEST: u8 = 0;

/// A cluster member as reported to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterServer {
    /// Node name
    pub id: String,
    /// Address the node's RPC surface listens on
    pub rpc_addr: String,
    /// Whether this node is the elected leader
    pub is_leader: bool,
}

/// Configuration for a distributed log node
#[derive(Debug, Clone)]
pub struct DistributedConfig {
    /// This node's name
    pub local_id: String,
    /// Address peers dial to reach this node
    pub local_addr: String,
    /// Seed the cluster with this node as the sole voter
    pub bootstrap: bool,
    /// Segment limits for both log instances
    pub segment: SegmentConfig,
    /// Consensus timing
    pub consensus: ConsensusConfig,
}

/// Replicated, segmented record log
pub struct DistributedLog {
    log: Arc<Log>,
    raft: Raft<LogFsm>,
    apply_timeout: Duration,
}

impl DistributedLog {
    /// Open the local log and boot the consensus runtime under
    /// `data_dir`
    pub fn new(
        data_dir: &Path,
        config: DistributedConfig,
        layer: Arc<StreamLayer>,
    ) -> Result<Self> {
        let log = Arc::new(Log::open(&data_dir.join("log"), config.segment)?);

        let mut raft_segment = config.segment;
        raft_segment.initial_offset = 1;
        let raft_log = Log::open(&data_dir.join("raft").join("log"), raft_segment)?;

        let stable = StableStore::open(&data_dir.join("raft").join("stable"))?;
        let snapshots = SnapshotStore::open(&data_dir.join("raft").join("snapshots"))?;

        let raft_config = RaftConfig {
            local_id: config.local_id,
            local_addr: config.local_addr,
            bootstrap: config.bootstrap,
            heartbeat_interval: Duration::from_millis(config.consensus.heartbeat_interval_ms),
            election_timeout_min: Duration::from_millis(config.consensus.election_timeout_min_ms),
            election_timeout_max: Duration::from_millis(config.consensus.election_timeout_max_ms),
            snapshot_threshold: config.consensus.snapshot_threshold,
            rpc_timeout: Duration::from_secs(10),
        };
        let apply_timeout = config.consensus.apply_timeout();

        let fsm = Arc::new(LogFsm {
            log: Arc::clone(&log),
        });
        let raft = Raft::new(
            raft_config,
            fsm,
            Arc::new(RaftLogAdapter { log: raft_log }),
            stable,
            snapshots,
            layer,
        )?;

        Ok(Self {
            log,
            raft,
            apply_timeout,
        })
    }

    /// Append a record through consensus, returning its offset once
    /// the entry commits. Only the leader accepts appends.
    pub async fn append(&self, record: &Record) -> Result<u64> {
        let mut buf = vec![APPEND_REQUEST];
        buf.extend(bincode::serialize(record)?);

        let submit = self.raft.apply(EntryKind::Command, buf);
        match tokio::time::timeout(self.apply_timeout, submit).await {
            Ok(outcome) => outcome?,
            Err(_) => Err(Error::Timeout("append commit".into())),
        }
    }

    /// Read the record at `offset` from the local log
    pub fn read(&self, offset: u64) -> Result<Record> {
        self.log.read(offset)
    }

    /// Add a server to the cluster.
    ///
    /// A server already present under the same id and address is a
    /// no-op; an id or address collision removes the stale entry
    /// before adding the voter.
    pub async fn join(&self, id: &str, addr: &str) -> Result<()> {
        for server in self.raft.servers() {
            if server.id == id || server.addr == addr {
                if server.id == id && server.addr == addr {
                    return Ok(());
                }
                self.raft.remove_server(&server.id).await?;
            }
        }
        self.raft.add_voter(id, addr).await
    }

    /// Remove a server from the cluster
    pub async fn leave(&self, id: &str) -> Result<()> {
        self.raft.remove_server(id).await
    }

    /// Block until a leader is known, polling once a second
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.raft.leader().is_some() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout("waiting for leader".into()));
            }
            tokio::time::sleep(Duration::from_secs(1).min(timeout)).await;
        }
    }

    /// Current cluster members, with the leader marked
    pub fn get_servers(&self) -> Vec<ClusterServer> {
        let leader_addr = self.raft.leader().map(|(_, addr)| addr);
        self.raft
            .servers()
            .into_iter()
            .map(|server| ClusterServer {
                is_leader: Some(&server.addr) == leader_addr.as_ref(),
                id: server.id,
                rpc_addr: server.addr,
            })
            .collect()
    }

    /// Whether this node is the leader
    pub fn is_leader(&self) -> bool {
        self.raft.is_leader()
    }

    /// Shut down consensus, then close the local log
    pub async fn close(&self) -> Result<()> {
        self.raft.shutdown().await?;
        self.log.close()
    }
}

/// State machine adapter: committed entries append to the local log
struct LogFsm {
    log: Arc<Log>,
}

impl LogFsm {
    fn apply_append(&self, payload: &[u8]) -> Result<u64> {
        let record: Record = bincode::deserialize(payload)?;
        self.log.append(&record)
    }
}

impl StateMachine for LogFsm {
    type Output = Result<u64>;

    fn apply(&self, entry: &LogEntry) -> Result<u64> {
        let Some((&request_type, payload)) = entry.data.split_first() else {
            return Err(Error::Internal("empty apply payload".into()));
        };

        match request_type {
            APPEND_REQUEST => self.apply_append(payload),
            other => Err(Error::Internal(format!(
                "unknown request type: {}",
                other
            ))),
        }
    }

    fn snapshot(&self) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(self.log.reader()))
    }

    fn restore(&self, reader: &mut dyn Read) -> Result<()> {
        let mut first = true;
        while let Some(frame) = crate::commitlog::read_frame(reader)? {
            let record = Record::deserialize(&frame)?;
            if first {
                self.log.reset_to(record.offset)?;
                first = false;
            }
            self.log.append(&record)?;
        }
        Ok(())
    }
}

/// Replication log store: a second segmented log whose offsets are the
/// consensus indexes
struct RaftLogAdapter {
    log: Log,
}

impl LogStore for RaftLogAdapter {
    fn first_index(&self) -> Result<u64> {
        Ok(self.log.lowest_offset())
    }

    fn last_index(&self) -> Result<u64> {
        Ok(self.log.highest_offset())
    }

    fn entry(&self, index: u64) -> Result<LogEntry> {
        let record = self.log.read(index)?;
        Ok(LogEntry {
            index: record.offset,
            term: record.term,
            kind: EntryKind::from_u32(record.kind)?,
            data: record.value,
        })
    }

    fn append(&self, entries: &[LogEntry]) -> Result<()> {
        for entry in entries {
            let record = Record {
                value: entry.data.clone(),
                offset: 0,
                term: entry.term,
                kind: entry.kind.as_u32(),
            };
            let offset = self.log.append(&record)?;
            if offset != entry.index {
                return Err(Error::Corruption {
                    path: "raft/log".into(),
                    reason: format!(
                        "entry index {} landed at offset {}",
                        entry.index, offset
                    ),
                });
            }
        }
        Ok(())
    }

    fn delete_range(&self, _min: u64, max: u64) -> Result<()> {
        self.log.truncate(max)
    }

    fn reset(&self, next_index: u64) -> Result<()> {
        self.log.reset_to(next_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fsm(dir: &Path) -> LogFsm {
        LogFsm {
            log: Arc::new(Log::open(dir, SegmentConfig::default()).unwrap()),
        }
    }

    #[test]
    fn test_fsm_apply_append() {
        let dir = tempdir().unwrap();
        let fsm = fsm(dir.path());

        let record = Record::new(b"hello world".to_vec());
        let mut data = vec![APPEND_REQUEST];
        data.extend(bincode::serialize(&record).unwrap());

        let entry = LogEntry {
            index: 1,
            term: 1,
            kind: EntryKind::Command,
            data,
        };
        let offset = fsm.apply(&entry).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(fsm.log.read(0).unwrap().value, b"hello world");
    }

    #[test]
    fn test_fsm_rejects_unknown_request_type() {
        let dir = tempdir().unwrap();
        let fsm = fsm(dir.path());

        let entry = LogEntry {
            index: 1,
            term: 1,
            kind: EntryKind::Command,
            data: vec![42, 1, 2, 3],
        };
        assert!(fsm.apply(&entry).is_err());
        // The log is untouched
        assert_eq!(fsm.log.highest_offset(), 0);
        assert!(fsm.log.read(0).is_err());
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let src_dir = tempdir().unwrap();
        let dst_dir = tempdir().unwrap();

        let source = fsm(src_dir.path());
        for value in [b"first".as_slice(), b"second", b"third"] {
            source.log.append(&Record::new(value.to_vec())).unwrap();
        }

        let mut stream = source.snapshot().unwrap();
        let target = fsm(dst_dir.path());
        target.restore(stream.as_mut()).unwrap();

        for offset in source.log.lowest_offset()..=source.log.highest_offset() {
            assert_eq!(
                target.log.read(offset).unwrap(),
                source.log.read(offset).unwrap()
            );
        }
    }

    #[test]
    fn test_restore_resets_to_first_record_offset() {
        let src_dir = tempdir().unwrap();
        let dst_dir = tempdir().unwrap();

        // Source log starts at offset 7
        let config = SegmentConfig {
            initial_offset: 7,
            ..SegmentConfig::default()
        };
        let source = LogFsm {
            log: Arc::new(Log::open(src_dir.path(), config).unwrap()),
        };
        source.log.append(&Record::new(b"a".to_vec())).unwrap();
        source.log.append(&Record::new(b"b".to_vec())).unwrap();

        let mut stream = source.snapshot().unwrap();
        let target = fsm(dst_dir.path());
        target.restore(stream.as_mut()).unwrap();

        assert_eq!(target.log.lowest_offset(), 7);
        assert_eq!(target.log.highest_offset(), 8);
        assert_eq!(target.log.read(7).unwrap().value, b"a");
    }

    #[test]
    fn test_log_store_adapter_round_trip() {
        let dir = tempdir().unwrap();
        let mut config = SegmentConfig::default();
        config.initial_offset = 1;
        let adapter = RaftLogAdapter {
            log: Log::open(dir.path(), config).unwrap(),
        };

        // Empty: first=1, last=0
        assert_eq!(adapter.first_index().unwrap(), 1);
        assert_eq!(adapter.last_index().unwrap(), 0);

        let entries: Vec<LogEntry> = (1..=4)
            .map(|i| LogEntry {
                index: i,
                term: 2,
                kind: EntryKind::Command,
                data: format!("entry-{}", i).into_bytes(),
            })
            .collect();
        adapter.append(&entries).unwrap();

        assert_eq!(adapter.last_index().unwrap(), 4);
        let entry = adapter.entry(3).unwrap();
        assert_eq!(entry.term, 2);
        assert_eq!(entry.data, b"entry-3");
    }

    #[test]
    fn test_log_store_adapter_index_mismatch() {
        let dir = tempdir().unwrap();
        let mut config = SegmentConfig::default();
        config.initial_offset = 1;
        let adapter = RaftLogAdapter {
            log: Log::open(dir.path(), config).unwrap(),
        };

        let entry = LogEntry {
            index: 5,
            term: 1,
            kind: EntryKind::Command,
            data: b"gap".to_vec(),
        };
        assert!(adapter.append(std::slice::from_ref(&entry)).is_err());
    }
}
