//! Segmented Log
//!
//! Ordered list of segments under one directory. Appends go to the
//! active (last) segment, rolling to a fresh segment when the active
//! one fills; reads resolve the unique segment owning the offset.
//! One writer, many readers.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::SegmentConfig;
use crate::error::{Error, Result};

use super::record::Record;
use super::segment::Segment;
use super::store::{Store, LEN_WIDTH};

/// Segmented, append-only record log
pub struct Log {
    dir: PathBuf,
    inner: RwLock<LogInner>,
}

struct LogInner {
    config: SegmentConfig,
    /// Segments ordered by base offset; the last one is active
    segments: Vec<Segment>,
}

impl Log {
    /// Open the log in `dir`, loading existing segments or creating
    /// the initial one
    pub fn open(dir: &Path, config: SegmentConfig) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let log = Self {
            dir: dir.to_path_buf(),
            inner: RwLock::new(LogInner {
                config,
                segments: Vec::new(),
            }),
        };
        log.setup()?;
        Ok(log)
    }

    /// Load segments from disk, or create the initial segment
    fn setup(&self) -> Result<()> {
        let mut inner = self.inner.write();

        let mut base_offsets = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().map_or(false, |ext| ext == "store") {
                let stem = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or_default();
                let off = stem.parse::<u64>().map_err(|_| Error::Corruption {
                    path: path.display().to_string(),
                    reason: "segment file name is not a base offset".into(),
                })?;
                base_offsets.push(off);
            }
        }
        base_offsets.sort_unstable();

        for base in base_offsets {
            let config = inner.config;
            let segment = Segment::new(&self.dir, base, config)?;
            inner.segments.push(segment);
        }

        if inner.segments.is_empty() {
            let initial = inner.config.initial_offset;
            let config = inner.config;
            let segment = Segment::new(&self.dir, initial, config)?;
            inner.segments.push(segment);
        }

        Ok(())
    }

    /// Append a record to the active segment, rolling over afterwards
    /// if the segment filled up. Returns the assigned offset.
    pub fn append(&self, record: &Record) -> Result<u64> {
        let mut inner = self.inner.write();

        let active = inner
            .segments
            .last_mut()
            .ok_or_else(|| Error::Log("log has no active segment".into()))?;
        let offset = active.append(record)?;

        if active.is_maxed() {
            let next = Segment::new(&self.dir, offset + 1, inner.config)?;
            inner.segments.push(next);
        }

        Ok(offset)
    }

    /// Read the record at `off`
    pub fn read(&self, off: u64) -> Result<Record> {
        let inner = self.inner.read();

        let segment = inner
            .segments
            .iter()
            .find(|s| s.contains(off))
            .ok_or(Error::OffsetOutOfRange(off))?;

        segment.read(off)
    }

    /// Lowest offset present in the log
    pub fn lowest_offset(&self) -> u64 {
        let inner = self.inner.read();
        inner.segments.first().map_or(0, |s| s.base_offset())
    }

    /// Highest offset present in the log
    pub fn highest_offset(&self) -> u64 {
        let inner = self.inner.read();
        match inner.segments.last().map(|s| s.next_offset()) {
            Some(0) | None => 0,
            Some(next) => next - 1,
        }
    }

    /// Remove every segment whose records all fall at or below
    /// `lowest`, keeping the rest in order
    pub fn truncate(&self, lowest: u64) -> Result<()> {
        let mut inner = self.inner.write();

        let mut kept = Vec::with_capacity(inner.segments.len());
        for mut segment in inner.segments.drain(..) {
            if segment.next_offset() <= lowest + 1 {
                segment.remove()?;
            } else {
                kept.push(segment);
            }
        }
        inner.segments = kept;

        // The active segment must always exist; if truncation consumed
        // every segment, appends continue at the next offset
        if inner.segments.is_empty() {
            let next = Segment::new(&self.dir, lowest + 1, inner.config)?;
            inner.segments.push(next);
        }
        Ok(())
    }

    /// Frozen byte stream over every segment's raw store frames,
    /// positioned at the start of the first segment
    pub fn reader(&self) -> LogReader {
        let inner = self.inner.read();
        let stores = inner
            .segments
            .iter()
            .map(|s| {
                let store = s.store();
                let size = store.size();
                (store, size)
            })
            .collect();
        LogReader {
            stores,
            current: 0,
            pos: 0,
        }
    }

    /// Close every segment
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.write();
        for segment in inner.segments.iter_mut() {
            segment.close()?;
        }
        Ok(())
    }

    /// Close the log and delete its directory
    pub fn remove(&self) -> Result<()> {
        self.close()?;
        std::fs::remove_dir_all(&self.dir)?;
        Ok(())
    }

    /// Delete all data and restart from a fresh initial segment
    pub fn reset(&self) -> Result<()> {
        self.remove()?;
        std::fs::create_dir_all(&self.dir)?;
        {
            let mut inner = self.inner.write();
            inner.segments.clear();
        }
        self.setup()
    }

    /// Delete all data and restart with a new initial offset.
    ///
    /// Used when replaying a snapshot whose first record does not
    /// start at the configured initial offset.
    pub fn reset_to(&self, initial_offset: u64) -> Result<()> {
        {
            let mut inner = self.inner.write();
            inner.config.initial_offset = initial_offset;
        }
        self.reset()
    }
}

/// Sequential reader over the concatenated store files of a log.
///
/// The segment set and per-store sizes are captured at creation, so
/// the stream is a consistent view even while appends continue.
pub struct LogReader {
    stores: Vec<(Arc<Store>, u64)>,
    current: usize,
    pos: u64,
}

impl Read for LogReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            let Some((store, size)) = self.stores.get(self.current) else {
                return Ok(0);
            };

            if self.pos >= *size {
                self.current += 1;
                self.pos = 0;
                continue;
            }

            let remaining = (*size - self.pos) as usize;
            let want = buf.len().min(remaining);
            let n = store
                .read_at(&mut buf[..want], self.pos)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
            self.pos += n as u64;
            return Ok(n);
        }
    }
}

/// Read one `[length][payload]` frame from a store byte stream.
///
/// Returns `Ok(None)` at a clean end of stream.
pub(crate) fn read_frame(r: &mut (impl Read + ?Sized)) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; LEN_WIDTH as usize];
    match r.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let mut payload = vec![0u8; u64::from_be_bytes(len_buf) as usize];
    r.read_exact(&mut payload)?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config() -> SegmentConfig {
        SegmentConfig {
            max_store_bytes: 1024,
            max_index_bytes: 1024,
            initial_offset: 0,
        }
    }

    fn record() -> Record {
        Record::new(b"hello world".to_vec())
    }

    #[test]
    fn test_append_read_round_trip() {
        let dir = tempdir().unwrap();
        let log = Log::open(dir.path(), test_config()).unwrap();

        let off = log.append(&record()).unwrap();
        assert_eq!(off, 0);

        let read = log.read(off).unwrap();
        assert_eq!(read.value, b"hello world");
        assert_eq!(read.offset, off);
    }

    #[test]
    fn test_offsets_are_dense() {
        let dir = tempdir().unwrap();
        let config = SegmentConfig {
            initial_offset: 3,
            ..test_config()
        };
        let log = Log::open(dir.path(), config).unwrap();

        for expected in 3..8u64 {
            assert_eq!(log.append(&record()).unwrap(), expected);
        }
        assert_eq!(log.lowest_offset(), 3);
        assert_eq!(log.highest_offset(), 7);
    }

    #[test]
    fn test_out_of_range() {
        let dir = tempdir().unwrap();
        let log = Log::open(dir.path(), test_config()).unwrap();
        log.append(&record()).unwrap();

        assert!(matches!(log.read(1), Err(Error::OffsetOutOfRange(1))));
    }

    #[test]
    fn test_segment_rollover() {
        let dir = tempdir().unwrap();
        let config = SegmentConfig {
            max_store_bytes: 1024,
            // three entries per segment
            max_index_bytes: 36,
            initial_offset: 0,
        };
        let log = Log::open(dir.path(), config).unwrap();

        for expected in 0..7u64 {
            assert_eq!(log.append(&record()).unwrap(), expected);
        }

        // Rollover created segments at bases 3 and 6
        assert!(dir.path().join("3.store").exists());
        assert!(dir.path().join("6.store").exists());
        for off in 0..7u64 {
            assert_eq!(log.read(off).unwrap().offset, off);
        }
    }

    #[test]
    fn test_reopen_fidelity() {
        let dir = tempdir().unwrap();
        {
            let log = Log::open(dir.path(), test_config()).unwrap();
            for _ in 0..3 {
                log.append(&record()).unwrap();
            }
            log.close().unwrap();
        }

        let log = Log::open(dir.path(), test_config()).unwrap();
        assert_eq!(log.lowest_offset(), 0);
        assert_eq!(log.highest_offset(), 2);
        assert_eq!(log.append(&record()).unwrap(), 3);
    }

    #[test]
    fn test_truncate() {
        let dir = tempdir().unwrap();
        let config = SegmentConfig {
            max_store_bytes: 1024,
            max_index_bytes: 36,
            initial_offset: 0,
        };
        let log = Log::open(dir.path(), config).unwrap();

        for _ in 0..9 {
            log.append(&record()).unwrap();
        }

        log.truncate(5).unwrap();
        assert!(matches!(log.read(2), Err(Error::OffsetOutOfRange(2))));
        assert_eq!(log.lowest_offset(), 6);
        assert_eq!(log.read(6).unwrap().offset, 6);
    }

    #[test]
    fn test_truncate_everything_keeps_log_appendable() {
        let dir = tempdir().unwrap();
        let config = SegmentConfig {
            max_store_bytes: 1024,
            max_index_bytes: 36,
            initial_offset: 0,
        };
        let log = Log::open(dir.path(), config).unwrap();

        for _ in 0..3 {
            log.append(&record()).unwrap();
        }

        // Removes both the filled segment and the empty active one
        log.truncate(2).unwrap();
        assert_eq!(log.append(&record()).unwrap(), 3);
        assert_eq!(log.lowest_offset(), 3);
    }

    #[test]
    fn test_reader_streams_all_frames() {
        let dir = tempdir().unwrap();
        let config = SegmentConfig {
            max_store_bytes: 1024,
            max_index_bytes: 36,
            initial_offset: 0,
        };
        let log = Log::open(dir.path(), config).unwrap();

        for _ in 0..5 {
            log.append(&record()).unwrap();
        }

        let mut reader = log.reader();
        let mut offsets = Vec::new();
        while let Some(frame) = read_frame(&mut reader).unwrap() {
            offsets.push(Record::deserialize(&frame).unwrap().offset);
        }
        assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_reset_to() {
        let dir = tempdir().unwrap();
        let log = Log::open(dir.path(), test_config()).unwrap();
        for _ in 0..3 {
            log.append(&record()).unwrap();
        }

        log.reset_to(10).unwrap();
        assert_eq!(log.append(&record()).unwrap(), 10);
        assert_eq!(log.lowest_offset(), 10);
    }
}
