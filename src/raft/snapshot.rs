//! Snapshot Store
//!
//! File-backed snapshot storage. Each snapshot is a directory holding
//! a metadata file and the state machine's byte stream, written to a
//! temporary name and renamed into place. One snapshot is retained.

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::ServerInfo;

/// Metadata describing a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Last replication log index covered by the snapshot
    pub last_index: u64,
    /// Term of that entry
    pub last_term: u64,
    /// Configuration at snapshot time
    pub configuration: Vec<ServerInfo>,
}

/// Directory of retained snapshots
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Create or open the snapshot directory
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Persist a snapshot, replacing any previous one.
    ///
    /// The reader is drained into the sink; a failed copy removes the
    /// partial snapshot instead of leaving it behind.
    pub fn save(&self, meta: &SnapshotMeta, reader: &mut dyn Read) -> Result<()> {
        let name = format!("{}-{}", meta.last_term, meta.last_index);
        let tmp = self.dir.join(format!("{}.tmp", name));
        let dest = self.dir.join(&name);

        fs::create_dir_all(&tmp)?;
        let result = (|| -> Result<()> {
            let mut state = BufWriter::new(File::create(tmp.join("state.bin"))?);
            std::io::copy(reader, &mut state)?;
            state.flush()?;
            state.get_ref().sync_all()?;

            fs::write(tmp.join("meta.bin"), bincode::serialize(meta)?)?;
            Ok(())
        })();

        if let Err(e) = result {
            let _ = fs::remove_dir_all(&tmp);
            return Err(e);
        }

        if dest.exists() {
            fs::remove_dir_all(&dest)?;
        }
        fs::rename(&tmp, &dest)?;

        self.retain(&name)?;
        tracing::info!(
            last_index = meta.last_index,
            last_term = meta.last_term,
            "snapshot saved"
        );
        Ok(())
    }

    /// Metadata of the most recent snapshot, if any
    pub fn latest_meta(&self) -> Result<Option<SnapshotMeta>> {
        Ok(self.latest_dir()?.map(|(_, meta)| meta))
    }

    /// Open the most recent snapshot for reading
    pub fn latest(&self) -> Result<Option<(SnapshotMeta, File)>> {
        match self.latest_dir()? {
            Some((path, meta)) => {
                let file = File::open(path.join("state.bin"))?;
                Ok(Some((meta, file)))
            }
            None => Ok(None),
        }
    }

    fn latest_dir(&self) -> Result<Option<(PathBuf, SnapshotMeta)>> {
        let mut best: Option<(u64, PathBuf, SnapshotMeta)> = None;

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.is_dir() || path.extension().map_or(false, |e| e == "tmp") {
                continue;
            }

            let meta_path = path.join("meta.bin");
            if !meta_path.exists() {
                continue;
            }
            let meta: SnapshotMeta =
                bincode::deserialize(&fs::read(&meta_path)?).map_err(|e| Error::Corruption {
                    path: meta_path.display().to_string(),
                    reason: e.to_string(),
                })?;

            if best.as_ref().map_or(true, |(idx, _, _)| meta.last_index > *idx) {
                best = Some((meta.last_index, path, meta));
            }
        }

        Ok(best.map(|(_, path, meta)| (path, meta)))
    }

    /// Delete every snapshot directory except `keep`
    fn retain(&self, keep: &str) -> Result<()> {
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_dir() && path.file_name().and_then(|n| n.to_str()) != Some(keep) {
                let _ = fs::remove_dir_all(&path);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn meta(index: u64, term: u64) -> SnapshotMeta {
        SnapshotMeta {
            last_index: index,
            last_term: term,
            configuration: vec![ServerInfo {
                id: "node-1".to_string(),
                addr: "127.0.0.1:8400".to_string(),
            }],
        }
    }

    #[test]
    fn test_save_and_latest() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();

        assert!(store.latest().unwrap().is_none());

        let data = b"snapshot state bytes";
        store.save(&meta(10, 2), &mut &data[..]).unwrap();

        let (restored_meta, mut file) = store.latest().unwrap().unwrap();
        assert_eq!(restored_meta, meta(10, 2));

        let mut contents = Vec::new();
        file.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, data);
    }

    #[test]
    fn test_retains_only_newest() {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();

        store.save(&meta(5, 1), &mut &b"old"[..]).unwrap();
        store.save(&meta(12, 3), &mut &b"new"[..]).unwrap();

        let (latest, _) = store.latest().unwrap().unwrap();
        assert_eq!(latest.last_index, 12);

        let dirs: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .collect();
        assert_eq!(dirs.len(), 1);
    }
}
