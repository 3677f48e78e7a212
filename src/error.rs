// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Error types.
//!
//! Integrity failures found while replaying a log are the only condition the
//! runtime recovers from locally (the torn tail is discarded). Every other
//! variant ends in [`terminate`]: the supervisor restarts the process and
//! recovery replays from the last checkpoint.

use ambrosia_persistence::PersistenceError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AmbrosiaError {
    #[error("Version mismatch: running {running}, metadata says {stored}")]
    VersionMismatch { running: i64, stored: i64 },

    #[error("Missing checkpoint: {0}")]
    MissingCheckpoint(PathBuf),

    #[error("Missing log: {0}")]
    MissingLog(PathBuf),

    #[error("External metadata error: {0}")]
    ExternalMetadata(String),

    #[error("Log write error: {0}")]
    LogWrite(String),

    #[error("Integrity check failure at offset {offset}: {reason}")]
    IntegrityCheckFailure { offset: u64, reason: String },

    #[error("Illegal protocol byte: {0}")]
    IllegalProtocolByte(u8),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Checkpoint codec error: {0}")]
    Codec(String),

    #[error("Local service is gone: {0}")]
    ServiceGone(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Superseded: {0}")]
    Superseded(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl AmbrosiaError {
    pub fn is_integrity_failure(&self) -> bool {
        match self {
            AmbrosiaError::IntegrityCheckFailure { .. } => true,
            AmbrosiaError::Persistence(e) => e.is_torn(),
            _ => false,
        }
    }
}

impl From<bincode::error::EncodeError> for AmbrosiaError {
    fn from(e: bincode::error::EncodeError) -> Self {
        AmbrosiaError::Codec(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for AmbrosiaError {
    fn from(e: bincode::error::DecodeError) -> Self {
        AmbrosiaError::Codec(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AmbrosiaError>;

/// Where background tasks send the error that must end the process.
#[derive(Debug, Clone)]
pub struct FaultReporter {
    tx: tokio::sync::mpsc::UnboundedSender<AmbrosiaError>,
}

impl FaultReporter {
    pub fn report(&self, err: AmbrosiaError) {
        tracing::error!("background task failed: {}", err);
        let _ = self.tx.send(err);
    }
}

pub fn fault_channel() -> (FaultReporter, tokio::sync::mpsc::UnboundedReceiver<AmbrosiaError>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    (FaultReporter { tx }, rx)
}

/// Log the fault and end the process.
pub fn terminate(err: &AmbrosiaError) -> ! {
    tracing::error!("fatal runtime error, terminating: {}", err);
    metrics::counter!("ambrosia_fatal_errors_total", 1);
    std::process::exit(1)
}
