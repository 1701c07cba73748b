//! Consensus Wire Protocol
//!
//! Messages exchanged between peers over the stream layer.

use serde::{Deserialize, Serialize};

use super::{LogEntry, ServerInfo};

/// Protocol messages for peer communication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftMessage {
    // ========== Leader Election ==========
    /// Request vote (from candidate)
    RequestVote {
        term: u64,
        candidate_id: String,
        last_log_index: u64,
        last_log_term: u64,
    },

    /// Vote response
    RequestVoteResponse {
        term: u64,
        voter_id: String,
        vote_granted: bool,
    },

    // ========== Log Replication ==========
    /// Append entries request (heartbeat when `entries` is empty)
    AppendEntries {
        term: u64,
        leader_id: String,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },

    /// Append entries response
    AppendEntriesResponse {
        term: u64,
        follower_id: String,
        success: bool,
        match_index: u64,
    },

    // ========== Snapshot Transfer ==========
    /// Full state transfer for a peer whose next entry was compacted
    InstallSnapshot {
        term: u64,
        leader_id: String,
        last_index: u64,
        last_term: u64,
        configuration: Vec<ServerInfo>,
        data: Vec<u8>,
    },

    /// Snapshot install response
    InstallSnapshotResponse { term: u64, success: bool },
}

impl RaftMessage {
    /// Term carried by the message
    pub fn term(&self) -> u64 {
        match self {
            RaftMessage::RequestVote { term, .. }
            | RaftMessage::RequestVoteResponse { term, .. }
            | RaftMessage::AppendEntries { term, .. }
            | RaftMessage::AppendEntriesResponse { term, .. }
            | RaftMessage::InstallSnapshot { term, .. }
            | RaftMessage::InstallSnapshotResponse { term, .. } => *term,
        }
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            RaftMessage::RequestVote { .. } => "RequestVote",
            RaftMessage::RequestVoteResponse { .. } => "RequestVoteResponse",
            RaftMessage::AppendEntries { .. } => "AppendEntries",
            RaftMessage::AppendEntriesResponse { .. } => "AppendEntriesResponse",
            RaftMessage::InstallSnapshot { .. } => "InstallSnapshot",
            RaftMessage::InstallSnapshotResponse { .. } => "InstallSnapshotResponse",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::EntryKind;

    #[test]
    fn test_message_serialization() {
        let msg = RaftMessage::AppendEntries {
            term: 2,
            leader_id: "node-1".to_string(),
            prev_log_index: 4,
            prev_log_term: 1,
            entries: vec![LogEntry {
                index: 5,
                term: 2,
                kind: EntryKind::Command,
                data: b"payload".to_vec(),
            }],
            leader_commit: 4,
        };

        let bytes = bincode::serialize(&msg).unwrap();
        let restored: RaftMessage = bincode::deserialize(&bytes).unwrap();

        match restored {
            RaftMessage::AppendEntries { term, entries, .. } => {
                assert_eq!(term, 2);
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].index, 5);
            }
            _ => panic!("Wrong message type"),
        }
    }
}
