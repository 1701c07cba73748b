//! Store File
//!
//! Append-only byte file holding length-prefixed record frames:
//! `[8-byte BE length][payload]` repeated. Appends go through a
//! buffered writer; reads flush the buffer first and use positioned
//! reads, so a single store serves one writer and many readers.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt;
use std::path::Path;

use parking_lot::Mutex;

use crate::error::Result;

/// Width of the length prefix on every frame
pub const LEN_WIDTH: u64 = 8;

/// Append-only store file
pub struct Store {
    inner: Mutex<StoreInner>,
}

struct StoreInner {
    /// Read handle, used for positioned reads
    file: File,
    /// Buffered write handle over a duplicated descriptor
    buf: BufWriter<File>,
    /// Total bytes written, including buffered ones
    size: u64,
}

impl Store {
    /// Open (or create) a store file, resuming at its current size
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let size = file.metadata()?.len();

        let mut write_file = file.try_clone()?;
        write_file.seek(SeekFrom::End(0))?;

        Ok(Self {
            inner: Mutex::new(StoreInner {
                file,
                buf: BufWriter::new(write_file),
                size,
            }),
        })
    }

    /// Append a frame, returning the bytes written and the frame's
    /// starting position
    pub fn append(&self, p: &[u8]) -> Result<(u64, u64)> {
        let mut inner = self.inner.lock();

        let pos = inner.size;
        inner.buf.write_all(&(p.len() as u64).to_be_bytes())?;
        inner.buf.write_all(p)?;

        let written = LEN_WIDTH + p.len() as u64;
        inner.size += written;
        Ok((written, pos))
    }

    /// Read the frame starting at `pos`
    pub fn read(&self, pos: u64) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        inner.buf.flush()?;

        let mut len_buf = [0u8; LEN_WIDTH as usize];
        inner.file.read_exact_at(&mut len_buf, pos)?;

        let mut payload = vec![0u8; u64::from_be_bytes(len_buf) as usize];
        inner.file.read_exact_at(&mut payload, pos + LEN_WIDTH)?;
        Ok(payload)
    }

    /// Random read of raw bytes at `off`
    pub fn read_at(&self, p: &mut [u8], off: u64) -> Result<usize> {
        let mut inner = self.inner.lock();
        inner.buf.flush()?;
        Ok(inner.file.read_at(p, off)?)
    }

    /// Total bytes written so far
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// Flush buffered writes and sync to disk
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.buf.flush()?;
        inner.file.sync_all()?;
        Ok(())
    }
}
