//! Index File
//!
//! Memory-mapped array of fixed-width entries mapping a segment's
//! relative offsets to store positions. Each entry is 12 bytes:
//! `[4-byte BE relative offset][8-byte BE store position]`, so entry
//! `n` lives at byte `n * 12` and lookup is a single mapped read.
//!
//! The file is grown to its configured capacity on open so the map
//! never needs remapping, and truncated back to the used size on close.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::{Error, Result};

/// Width of the relative-offset field
const OFF_WIDTH: u64 = 4;
/// Width of the store-position field
const POS_WIDTH: u64 = 8;
/// Width of a full index entry
pub const ENT_WIDTH: u64 = OFF_WIDTH + POS_WIDTH;

/// Memory-mapped segment index
pub struct Index {
    file: File,
    path: PathBuf,
    mmap: Option<MmapMut>,
    size: u64,
}

impl Index {
    /// Open (or create) an index file, growing it to `max_index_bytes`
    /// and mapping it read-write
    pub fn open(path: &Path, max_index_bytes: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let size = file.metadata()?.len();
        file.set_len(max_index_bytes)?;

        let mmap = unsafe { MmapMut::map_mut(&file)? };

        Ok(Self {
            file,
            path: path.to_path_buf(),
            mmap: Some(mmap),
            size,
        })
    }

    /// Read entry `n`, or the last entry when `n` is -1.
    ///
    /// Returns the entry's relative offset and store position. Reading
    /// from an empty index or past the high-water mark fails with an
    /// unexpected-EOF I/O error.
    pub fn read(&self, n: i64) -> Result<(u32, u64)> {
        if self.size == 0 {
            return Err(eof());
        }

        let entry = if n == -1 {
            (self.size / ENT_WIDTH) - 1
        } else {
            n as u64
        };

        let pos = entry * ENT_WIDTH;
        if self.size < pos + ENT_WIDTH {
            return Err(eof());
        }

        let mmap = self.mmap.as_ref().ok_or_else(closed)?;
        let off = u32::from_be_bytes(
            mmap[pos as usize..(pos + OFF_WIDTH) as usize]
                .try_into()
                .expect("entry slice is 4 bytes"),
        );
        let store_pos = u64::from_be_bytes(
            mmap[(pos + OFF_WIDTH) as usize..(pos + ENT_WIDTH) as usize]
                .try_into()
                .expect("entry slice is 8 bytes"),
        );

        Ok((off, store_pos))
    }

    /// Append an entry, failing with `IndexFull` when the mapped
    /// capacity is exhausted
    pub fn write(&mut self, off: u32, pos: u64) -> Result<()> {
        let mmap = self.mmap.as_mut().ok_or_else(closed)?;

        if (mmap.len() as u64) < self.size + ENT_WIDTH {
            return Err(Error::IndexFull);
        }

        let at = self.size as usize;
        mmap[at..at + OFF_WIDTH as usize].copy_from_slice(&off.to_be_bytes());
        mmap[at + OFF_WIDTH as usize..at + ENT_WIDTH as usize]
            .copy_from_slice(&pos.to_be_bytes());

        self.size += ENT_WIDTH;
        Ok(())
    }

    /// Bytes of the index currently in use
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush the map, sync the file, and shrink it to the used size
    pub fn close(&mut self) -> Result<()> {
        if let Some(mmap) = self.mmap.take() {
            mmap.flush()?;
            drop(mmap);
            self.file.sync_all()?;
            self.file.set_len(self.size)?;
        }
        Ok(())
    }
}

fn eof() -> Error {
    Error::Io(io::Error::from(io::ErrorKind::UnexpectedEof))
}

fn closed() -> Error {
    Error::Log("index is closed".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("write_read.index");
        let mut index = Index::open(&path, 1024).unwrap();

        // Empty index has no entries
        assert!(index.read(-1).is_err());

        let entries = [(0u32, 0u64), (1, 10)];
        for (off, pos) in entries {
            index.write(off, pos).unwrap();
            let (read_off, read_pos) = index.read(off as i64).unwrap();
            assert_eq!(read_off, off);
            assert_eq!(read_pos, pos);
        }

        // -1 reads the last entry
        let (off, pos) = index.read(-1).unwrap();
        assert_eq!((off, pos), (1, 10));

        // Reading past the high-water mark fails
        assert!(index.read(2).is_err());
    }

    #[test]
    fn test_write_full() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("full.index");
        let mut index = Index::open(&path, ENT_WIDTH * 2).unwrap();

        index.write(0, 0).unwrap();
        index.write(1, 10).unwrap();
        assert!(matches!(index.write(2, 20), Err(Error::IndexFull)));
    }

    #[test]
    fn test_close_truncates_and_reopen_recovers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("truncate.index");

        {
            let mut index = Index::open(&path, 1024).unwrap();
            index.write(0, 0).unwrap();
            index.write(1, 10).unwrap();
            index.close().unwrap();
        }

        // File shrank to exactly two entries
        assert_eq!(std::fs::metadata(&path).unwrap().len(), ENT_WIDTH * 2);

        let index = Index::open(&path, 1024).unwrap();
        let (off, pos) = index.read(-1).unwrap();
        assert_eq!((off, pos), (1, 10));
    }
}
