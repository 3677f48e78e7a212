// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Sequential log reader with torn-tail detection.
//!
//! A record is trusted only if it is complete, its check bytes match, it was
//! written by the expected committer, and its write sequence id follows the
//! previous record's. Anything else is a torn record: the reader rewinds to
//! the start of it so the caller can stop there or retry once the writer has
//! made more progress.

use crate::error::{PersistenceError, Result};
use crate::record::{self, RecordHeader, WatermarkTables, HEADER_SIZE};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Byte offset of the header inside the file.
    pub offset: u64,
    pub header: RecordHeader,
    pub payload: Vec<u8>,
    pub tables: WatermarkTables,
}

#[derive(Debug)]
pub enum ReadOutcome {
    Record(LogRecord),
    /// Clean end of file on a record boundary.
    EndOfLog,
    /// Incomplete or failing record at `offset`. The reader is positioned at
    /// `offset` again.
    Torn { offset: u64, reason: String },
}

pub struct LogReader {
    path: PathBuf,
    reader: BufReader<File>,
    /// Offset just past the last good record.
    position: u64,
    committer_id: Option<u32>,
    next_write_seq: Option<u64>,
    /// Set once iteration has hit the end or a torn record.
    exhausted: bool,
}

impl LogReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        Ok(Self {
            path,
            reader: BufReader::new(file),
            position: 0,
            committer_id: None,
            next_write_seq: None,
            exhausted: false,
        })
    }

    /// Reject records written by any other committer.
    pub fn expect_committer(mut self, committer_id: u32) -> Self {
        self.committer_id = Some(committer_id);
        self
    }

    /// Require the next record to carry exactly `write_seq_id`.
    pub fn expect_write_seq(mut self, write_seq_id: u64) -> Self {
        self.next_write_seq = Some(write_seq_id);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Write sequence id the next record must carry, once known.
    pub fn next_write_seq(&self) -> Option<u64> {
        self.next_write_seq
    }

    /// Seek back to the end of the last good record.
    pub fn rewind(&mut self) -> Result<()> {
        self.reader.seek(SeekFrom::Start(self.position))?;
        Ok(())
    }

    pub fn next_record(&mut self) -> Result<ReadOutcome> {
        let offset = self.position;
        match self.read_record(offset) {
            Ok(Some(record)) => Ok(ReadOutcome::Record(record)),
            Ok(None) => Ok(ReadOutcome::EndOfLog),
            Err(e) if e.is_torn() || is_eof(&e) || matches!(e, PersistenceError::InvalidFormat(_)) => {
                let reason = e.to_string();
                self.rewind()?;
                Ok(ReadOutcome::Torn { offset, reason })
            }
            Err(e) => Err(e),
        }
    }

    fn read_record(&mut self, offset: u64) -> Result<Option<LogRecord>> {
        let mut head = [0u8; HEADER_SIZE];
        let got = fill(&mut self.reader, &mut head)?;
        if got == 0 {
            return Ok(None);
        }
        if got < HEADER_SIZE {
            return Err(torn(offset, format!("header cut short after {} bytes", got)));
        }
        let header = RecordHeader::from_bytes(&head);

        if let Some(expected) = self.committer_id {
            if header.committer_id != expected {
                return Err(torn(
                    offset,
                    format!("committer id {} does not match {}", header.committer_id, expected),
                ));
            }
        }
        if let Some(expected) = self.next_write_seq {
            if header.write_seq_id != expected {
                return Err(torn(
                    offset,
                    format!("write sequence {} out of order, expected {}", header.write_seq_id, expected),
                ));
            }
        }

        let body_len = header.body_len().map_err(|e| torn(offset, e.to_string()))?;
        let file_len = self.reader.get_ref().metadata()?.len();
        if offset + header.total_size as u64 > file_len {
            return Err(torn(offset, format!("record of {} bytes runs past end of file", header.total_size)));
        }
        let mut body = vec![0u8; body_len];
        self.reader.read_exact(&mut body)?;

        let found = record::check_bytes(&body);
        if found != header.check_bytes {
            return Err(PersistenceError::ChecksumMismatch {
                expected: header.check_bytes,
                found,
            });
        }
        let (payload, tables) = record::split_body(&body)?;
        let payload = payload.to_vec();

        self.position = offset + header.total_size as u64;
        self.next_write_seq = Some(header.write_seq_id + 1);
        Ok(Some(LogRecord {
            offset,
            header,
            payload,
            tables,
        }))
    }
}

impl Iterator for LogReader {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        let item = match self.next_record() {
            Ok(ReadOutcome::Record(record)) => return Some(Ok(record)),
            Ok(ReadOutcome::EndOfLog) => None,
            Ok(ReadOutcome::Torn { offset, reason }) => Some(Err(PersistenceError::TornRecord { offset, reason })),
            Err(e) => Some(Err(e)),
        };
        self.exhausted = true;
        item
    }
}

fn is_eof(err: &PersistenceError) -> bool {
    matches!(err, PersistenceError::IoError(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
}

fn torn(offset: u64, reason: String) -> PersistenceError {
    PersistenceError::TornRecord { offset, reason }
}

/// Read until `buf` is full or the file ends. Returns the bytes read.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut got = 0;
    while got < buf.len() {
        match reader.read(&mut buf[got..]) {
            Ok(0) => break,
            Ok(n) => got += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(got)
}
