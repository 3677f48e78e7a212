// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use ambrosia::AmbrosiaError;
use ambrosia_persistence::PersistenceError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Runtime error: {0}")]
    Runtime(#[from] AmbrosiaError),
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("Could not read config file {path}: {source}")]
    ConfigFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Config(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Telemetry error: {0}")]
    Telemetry(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NodeError>;
