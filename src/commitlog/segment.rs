//! Log Segment
//!
//! A segment ties one store file to one index file under a shared base
//! offset. Appends frame the record into the store and add a
//! (relative offset, position) entry to the index; reads resolve the
//! index entry and decode the frame.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::SegmentConfig;
use crate::error::{Error, Result};

use super::index::Index;
use super::record::Record;
use super::store::Store;

/// A single log segment covering offsets `[base_offset, next_offset)`
pub struct Segment {
    store: Arc<Store>,
    index: Index,
    store_path: PathBuf,
    base_offset: u64,
    next_offset: u64,
    config: SegmentConfig,
}

impl Segment {
    /// Open (or create) the segment for `base_offset` in `dir`.
    ///
    /// The next offset resumes after the last index entry, so the
    /// index is authoritative for which offsets are visible after a
    /// reopen.
    pub fn new(dir: &Path, base_offset: u64, config: SegmentConfig) -> Result<Self> {
        let store_path = dir.join(format!("{}.store", base_offset));
        let index_path = dir.join(format!("{}.index", base_offset));

        let store = Arc::new(Store::open(&store_path)?);
        let index = Index::open(&index_path, config.max_index_bytes)?;

        let next_offset = match index.read(-1) {
            Ok((rel, _)) => base_offset + rel as u64 + 1,
            Err(_) => base_offset,
        };

        Ok(Self {
            store,
            index,
            store_path,
            base_offset,
            next_offset,
            config,
        })
    }

    /// Append a record, assigning and returning its offset
    pub fn append(&mut self, record: &Record) -> Result<u64> {
        let offset = self.next_offset;

        let mut stamped = record.clone();
        stamped.offset = offset;
        let bytes = stamped.serialize()?;

        let (_, pos) = self.store.append(&bytes)?;
        self.index.write((offset - self.base_offset) as u32, pos)?;

        self.next_offset += 1;
        Ok(offset)
    }

    /// Read the record at the absolute offset `off`
    pub fn read(&self, off: u64) -> Result<Record> {
        let (_, pos) = self
            .index
            .read((off - self.base_offset) as i64)
            .map_err(|_| Error::OffsetOutOfRange(off))?;

        let bytes = self.store.read(pos)?;
        Ok(Record::deserialize(&bytes)?)
    }

    /// Whether either file has reached its configured limit
    pub fn is_maxed(&self) -> bool {
        self.store.size() >= self.config.max_store_bytes
            || self.index.size() >= self.config.max_index_bytes
    }

    /// First offset owned by this segment
    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// Offset the next append will receive
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// Whether `off` falls inside this segment's range
    pub fn contains(&self, off: u64) -> bool {
        self.base_offset <= off && off < self.next_offset
    }

    /// Shared handle to the underlying store
    pub(crate) fn store(&self) -> Arc<Store> {
        Arc::clone(&self.store)
    }

    /// Close both files
    pub fn close(&mut self) -> Result<()> {
        self.index.close()?;
        self.store.close()?;
        Ok(())
    }

    /// Close the segment and unlink both files
    pub fn remove(&mut self) -> Result<()> {
        self.close()?;
        std::fs::remove_file(self.index.path())?;
        std::fs::remove_file(&self.store_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record() -> Record {
        Record::new(b"hello world".to_vec())
    }

    #[test]
    fn test_append_read_rollover() {
        let dir = tempdir().unwrap();
        let config = SegmentConfig {
            max_store_bytes: 1024,
            // Exactly three 12-byte entries
            max_index_bytes: 36,
            initial_offset: 0,
        };

        let mut segment = Segment::new(dir.path(), 16, config).unwrap();
        assert_eq!(segment.next_offset(), 16);
        assert!(!segment.is_maxed());

        for i in 0..3u64 {
            let off = segment.append(&record()).unwrap();
            assert_eq!(off, 16 + i);

            let read = segment.read(off).unwrap();
            assert_eq!(read.value, b"hello world");
            assert_eq!(read.offset, off);
        }

        // Index is at capacity
        assert!(segment.is_maxed());
        assert!(segment.append(&record()).is_err());
    }

    #[test]
    fn test_maxed_by_store() {
        let dir = tempdir().unwrap();
        let frame = record().serialize().unwrap().len() as u64 + 8;
        let config = SegmentConfig {
            max_store_bytes: frame * 3,
            max_index_bytes: 1024,
            initial_offset: 0,
        };

        let mut segment = Segment::new(dir.path(), 0, config).unwrap();
        for _ in 0..3 {
            segment.append(&record()).unwrap();
        }
        assert!(segment.is_maxed());
    }

    #[test]
    fn test_reopen_resumes_next_offset() {
        let dir = tempdir().unwrap();
        let config = SegmentConfig {
            max_store_bytes: 1024,
            max_index_bytes: 1024,
            initial_offset: 0,
        };

        {
            let mut segment = Segment::new(dir.path(), 5, config).unwrap();
            segment.append(&record()).unwrap();
            segment.append(&record()).unwrap();
            segment.close().unwrap();
        }

        let segment = Segment::new(dir.path(), 5, config).unwrap();
        assert_eq!(segment.next_offset(), 7);
        assert_eq!(segment.read(6).unwrap().offset, 6);
    }

    #[test]
    fn test_read_out_of_range() {
        let dir = tempdir().unwrap();
        let config = SegmentConfig {
            max_store_bytes: 1024,
            max_index_bytes: 1024,
            initial_offset: 0,
        };

        let mut segment = Segment::new(dir.path(), 0, config).unwrap();
        segment.append(&record()).unwrap();

        assert!(matches!(
            segment.read(1),
            Err(Error::OffsetOutOfRange(1))
        ));
    }

    #[test]
    fn test_remove_unlinks_files() {
        let dir = tempdir().unwrap();
        let config = SegmentConfig::default();

        let mut segment = Segment::new(dir.path(), 0, config).unwrap();
        segment.append(&record()).unwrap();
        segment.remove().unwrap();

        assert!(!dir.path().join("0.store").exists());
        assert!(!dir.path().join("0.index").exists());
    }
}
