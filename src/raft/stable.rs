//! Stable Store
//!
//! SQLite-backed persistence for the consensus state that must survive
//! restarts: current term, the vote cast in that term, the latest
//! adopted configuration, and the last applied index.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection};

use crate::error::{Error, Result};

use super::ServerInfo;

/// Persistent consensus state
pub struct StableStore {
    conn: Mutex<Connection>,
}

impl StableStore {
    /// Create or open the stable store under `dir`
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let conn = Connection::open(dir.join("state.db"))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS consensus_state (
                key TEXT PRIMARY KEY,
                value_int INTEGER,
                value_text TEXT,
                value_blob BLOB,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Get the current term
    pub fn current_term(&self) -> Result<u64> {
        self.get_int("current_term").map(|v| v.unwrap_or(0))
    }

    /// Set the current term
    pub fn set_current_term(&self, term: u64) -> Result<()> {
        self.set_int("current_term", term)
    }

    /// Get the node voted for in the current term
    pub fn voted_for(&self) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let result: std::result::Result<String, _> = conn.query_row(
            "SELECT value_text FROM consensus_state WHERE key = 'voted_for'",
            [],
            |row| row.get(0),
        );

        match result {
            Ok(id) => Ok(Some(id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::State(format!("failed to get voted_for: {}", e))),
        }
    }

    /// Set (or clear) the vote for the current term
    pub fn set_voted_for(&self, node_id: Option<&str>) -> Result<()> {
        let conn = self.conn.lock();
        match node_id {
            Some(id) => {
                conn.execute(
                    r#"
                    INSERT INTO consensus_state (key, value_text) VALUES ('voted_for', ?1)
                    ON CONFLICT(key) DO UPDATE SET value_text = ?1, updated_at = CURRENT_TIMESTAMP
                    "#,
                    params![id],
                )?;
            }
            None => {
                conn.execute("DELETE FROM consensus_state WHERE key = 'voted_for'", [])?;
            }
        }
        Ok(())
    }

    /// Get the latest adopted configuration
    pub fn configuration(&self) -> Result<Option<Vec<ServerInfo>>> {
        let conn = self.conn.lock();
        let result: std::result::Result<Vec<u8>, _> = conn.query_row(
            "SELECT value_blob FROM consensus_state WHERE key = 'configuration'",
            [],
            |row| row.get(0),
        );

        match result {
            Ok(blob) => Ok(Some(bincode::deserialize(&blob)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::State(format!("failed to get configuration: {}", e))),
        }
    }

    /// Persist the latest adopted configuration
    pub fn set_configuration(&self, servers: &[ServerInfo]) -> Result<()> {
        let blob = bincode::serialize(servers)?;
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO consensus_state (key, value_blob) VALUES ('configuration', ?1)
            ON CONFLICT(key) DO UPDATE SET value_blob = ?1, updated_at = CURRENT_TIMESTAMP
            "#,
            params![blob],
        )?;
        Ok(())
    }

    /// Get the last applied index
    pub fn last_applied(&self) -> Result<u64> {
        self.get_int("last_applied").map(|v| v.unwrap_or(0))
    }

    /// Set the last applied index
    pub fn set_last_applied(&self, index: u64) -> Result<()> {
        self.set_int("last_applied", index)
    }

    fn get_int(&self, key: &str) -> Result<Option<u64>> {
        let conn = self.conn.lock();
        let result: std::result::Result<i64, _> = conn.query_row(
            "SELECT value_int FROM consensus_state WHERE key = ?1",
            params![key],
            |row| row.get(0),
        );

        match result {
            Ok(v) => Ok(Some(v as u64)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::State(format!("failed to get {}: {}", key, e))),
        }
    }

    fn set_int(&self, key: &str, value: u64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO consensus_state (key, value_int) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value_int = ?2, updated_at = CURRENT_TIMESTAMP
            "#,
            params![key, value as i64],
        )?;
        Ok(())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::State(format!("SQLite error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_term_and_vote() {
        let dir = tempdir().unwrap();
        let store = StableStore::open(dir.path()).unwrap();

        assert_eq!(store.current_term().unwrap(), 0);
        store.set_current_term(5).unwrap();
        assert_eq!(store.current_term().unwrap(), 5);

        assert!(store.voted_for().unwrap().is_none());
        store.set_voted_for(Some("node-2")).unwrap();
        assert_eq!(store.voted_for().unwrap(), Some("node-2".to_string()));
        store.set_voted_for(None).unwrap();
        assert!(store.voted_for().unwrap().is_none());
    }

    #[test]
    fn test_configuration_round_trip() {
        let dir = tempdir().unwrap();
        let store = StableStore::open(dir.path()).unwrap();

        assert!(store.configuration().unwrap().is_none());

        let servers = vec![
            ServerInfo {
                id: "node-1".to_string(),
                addr: "127.0.0.1:8400".to_string(),
            },
            ServerInfo {
                id: "node-2".to_string(),
                addr: "127.0.0.1:8500".to_string(),
            },
        ];
        store.set_configuration(&servers).unwrap();
        assert_eq!(store.configuration().unwrap(), Some(servers));
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = StableStore::open(dir.path()).unwrap();
            store.set_current_term(7).unwrap();
            store.set_last_applied(42).unwrap();
        }

        let store = StableStore::open(dir.path()).unwrap();
        assert_eq!(store.current_term().unwrap(), 7);
        assert_eq!(store.last_applied().unwrap(), 42);
    }
}
