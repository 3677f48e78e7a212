// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use thiserror::Error;
use std::io;
use std::path::PathBuf;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Checksum mismatch: expected {expected:#018x}, found {found:#018x}")]
    ChecksumMismatch {
        expected: u64,
        found: u64,
    },
    #[error("Torn record at offset {offset}: {reason}")]
    TornRecord {
        offset: u64,
        reason: String,
    },
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Invalid data format: {0}")]
    InvalidFormat(String),
    #[error("File is locked by another process: {0}")]
    Locked(PathBuf),
    #[error("Metadata store error: {0}")]
    Metadata(String),
}

impl PersistenceError {
    /// True for conditions that mean "the tail of the log is not durable yet".
    pub fn is_torn(&self) -> bool {
        matches!(
            self,
            PersistenceError::TornRecord { .. } | PersistenceError::ChecksumMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PersistenceError>;
