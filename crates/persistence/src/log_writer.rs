// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Buffered append-only log writer.
//!
//! Bytes accumulate in an owned buffer and reach the file in whole 4 KiB
//! sectors. `flush` writes the partial tail and calls `sync_data`, so it does
//! not return until the OS reports the bytes durable.
//!
//! # Invariants
//! - `position()` is the logical end of the log, buffered bytes included.
//! - After `flush()` returns, every byte before `position()` is on disk.

use crate::error::Result;
use crate::record::{self, RecordHeader, WatermarkTables};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const SECTOR_SIZE: usize = 4096;

/// Payloads at least this large skip the staging buffer.
const STREAM_THRESHOLD: usize = 16 * SECTOR_SIZE;

#[derive(Debug)]
pub struct LogWriter {
    path: PathBuf,
    file: File,
    buf: Vec<u8>,
    /// Bytes already handed to the file.
    written: u64,
}

impl LogWriter {
    /// Create (or truncate) a log file.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self::with_file(path, file, 0))
    }

    /// Open an existing log for appending at its current end.
    pub fn open_append(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).write(true).read(true).open(&path)?;
        Self::from_file(path, file)
    }

    /// Adopt an already-open handle. The writer keeps the handle (and any
    /// advisory lock taken on it) for its lifetime.
    pub fn from_file(path: impl AsRef<Path>, mut file: File) -> Result<Self> {
        let end = file.seek(SeekFrom::End(0))?;
        Ok(Self::with_file(path.as_ref().to_path_buf(), file, end))
    }

    fn with_file(path: PathBuf, file: File, written: u64) -> Self {
        Self {
            path,
            file,
            buf: Vec::with_capacity(2 * SECTOR_SIZE),
            written,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn position(&self) -> u64 {
        self.written + self.buf.len() as u64
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() >= STREAM_THRESHOLD {
            return self.append_stream(bytes);
        }
        self.buf.extend_from_slice(bytes);
        if self.buf.len() >= SECTOR_SIZE {
            let whole = self.buf.len() - self.buf.len() % SECTOR_SIZE;
            self.file.write_all(&self.buf[..whole])?;
            self.buf.drain(..whole);
            self.written += whole as u64;
        }
        Ok(())
    }

    /// Write `bytes` straight to the file after draining the staging buffer.
    pub fn append_stream(&mut self, bytes: &[u8]) -> Result<()> {
        self.drain_buffer()?;
        self.file.write_all(bytes)?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    /// Copy `len` bytes from `reader` straight to the file.
    pub fn append_from<R: Read>(&mut self, reader: &mut R, len: u64) -> Result<()> {
        self.drain_buffer()?;
        let copied = std::io::copy(&mut reader.take(len), &mut self.file)?;
        self.written += copied;
        if copied != len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("stream ended after {} of {} bytes", copied, len),
            )
            .into());
        }
        Ok(())
    }

    /// Append one framed record and return its header. The watermark tables
    /// travel inside the sized, checksummed body.
    pub fn append_record(
        &mut self,
        committer_id: u32,
        write_seq_id: u64,
        payload: &[u8],
        tables: &WatermarkTables,
    ) -> Result<RecordHeader> {
        let body = record::encode_body(payload, tables);
        let header = RecordHeader::new(committer_id, &body, write_seq_id);
        self.append(&header.to_bytes())?;
        self.append(&body)?;
        Ok(header)
    }

    fn drain_buffer(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            self.file.write_all(&self.buf)?;
            self.written += self.buf.len() as u64;
            self.buf.clear();
        }
        Ok(())
    }

    /// Durably persist everything appended so far.
    pub fn flush(&mut self) -> Result<()> {
        self.drain_buffer()?;
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Cut the file back to `len` bytes, dropping anything buffered past it.
    pub fn truncate_to(&mut self, len: u64) -> Result<()> {
        self.drain_buffer()?;
        self.file.set_len(len)?;
        self.file.seek(SeekFrom::Start(len))?;
        self.file.sync_all()?;
        self.written = len;
        Ok(())
    }

    pub fn into_file(mut self) -> Result<File> {
        self.flush()?;
        Ok(self.file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_position_counts_buffered_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log0");
        let mut writer = LogWriter::create(&path).unwrap();
        writer.append(&[1u8; 100]).unwrap();
        assert_eq!(writer.position(), 100);
        // Nothing reached the file yet.
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
        writer.flush().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 100);
    }

    #[test]
    fn test_whole_sectors_written_eagerly() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log0");
        let mut writer = LogWriter::create(&path).unwrap();
        writer.append(&vec![7u8; SECTOR_SIZE + 10]).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), SECTOR_SIZE as u64);
        assert_eq!(writer.position(), SECTOR_SIZE as u64 + 10);
    }

    #[test]
    fn test_stream_preserves_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chkpt1");
        let mut writer = LogWriter::create(&path).unwrap();
        writer.append(b"head").unwrap();
        writer.append_stream(&vec![9u8; STREAM_THRESHOLD]).unwrap();
        let mut tail: &[u8] = b"tail";
        writer.append_from(&mut tail, 4).unwrap();
        writer.flush().unwrap();

        let data = std::fs::read(&path).unwrap();
        assert_eq!(&data[..4], b"head");
        assert_eq!(&data[data.len() - 4..], b"tail");
        assert_eq!(data.len(), 8 + STREAM_THRESHOLD);
    }

    #[test]
    fn test_reopen_appends_at_end() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log0");
        let mut writer = LogWriter::create(&path).unwrap();
        writer.append(b"abc").unwrap();
        writer.flush().unwrap();
        drop(writer);

        let mut writer = LogWriter::open_append(&path).unwrap();
        assert_eq!(writer.position(), 3);
        writer.append(b"def").unwrap();
        writer.truncate_to(4).unwrap();
        writer.append(b"z").unwrap();
        writer.flush().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdz");
    }
}
