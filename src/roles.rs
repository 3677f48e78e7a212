// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Active-active role arbitration.
//!
//! There is no election protocol. A replica's role is whatever the file
//! locks it manages to hold say it is:
//! - the primary holds the lock on the current log file;
//! - the checkpointer holds the lock on the next checkpoint file;
//! - everyone else is a secondary, tailing the log until the primary's
//!   lock goes away.
//!
//! Every lock win is re-validated against the metadata pointers, because
//! a lock on a file that is no longer current proves nothing.

use crate::checkpoint::lock_checkpoint;
use crate::error::{AmbrosiaError, Result};
use crate::spin::{SpinPolicy, Spinner};
use ambrosia_persistence::metadata::keys;
use ambrosia_persistence::{lock, LogLayout, MetadataStore};
use std::fs::File;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Secondary,
    Checkpointer,
}

impl Role {
    fn gauge_value(self) -> f64 {
        match self {
            Role::Primary => 0.0,
            Role::Secondary => 1.0,
            Role::Checkpointer => 2.0,
        }
    }
}

pub fn publish_role(role: Role) {
    metrics::gauge!("ambrosia_role", role.gauge_value());
    tracing::info!("role is now {:?}", role);
}

/// Exclusive hold on checkpoint file `checkpoint_no`, the one the
/// checkpointer will write next.
#[derive(Debug)]
pub struct CheckpointLease {
    pub checkpoint_no: u64,
    pub file: File,
}

/// Proof that the primary let go of log `log_no`. The lock lives in `file`.
#[derive(Debug)]
pub struct PromotionTicket {
    pub log_no: u64,
    pub file: File,
}

pub(crate) fn metadata_err(e: ambrosia_persistence::PersistenceError) -> AmbrosiaError {
    AmbrosiaError::ExternalMetadata(e.to_string())
}

pub(crate) fn read_pointer(metadata: &dyn MetadataStore, service: &str, key: &str) -> Result<u64> {
    match metadata.get_i64(service, key).map_err(metadata_err)? {
        Some(v) if v >= 0 => Ok(v as u64),
        Some(v) => Err(AmbrosiaError::ExternalMetadata(format!("{} is negative: {}", key, v))),
        None => Err(AmbrosiaError::ExternalMetadata(format!("{} is not set", key))),
    }
}

/// Race for the next checkpoint file. The winner is the checkpointer.
pub fn determine_role(
    layout: &LogLayout,
    metadata: &dyn MetadataStore,
    service: &str,
) -> Result<(Role, Option<CheckpointLease>)> {
    loop {
        let last = read_pointer(metadata, service, keys::LAST_COMMITTED_CHECKPOINT)?;
        let Some(file) = lock_checkpoint(layout, last + 1)? else {
            return Ok((Role::Secondary, None));
        };
        let again = read_pointer(metadata, service, keys::LAST_COMMITTED_CHECKPOINT)?;
        if again != last {
            tracing::debug!("checkpoint pointer moved {} -> {} while locking, retrying", last, again);
            continue;
        }
        return Ok((
            Role::Checkpointer,
            Some(CheckpointLease {
                checkpoint_no: last + 1,
                file,
            }),
        ));
    }
}

/// Try to take the kill lock. Held by an upgrading secondary to force the
/// old primary down.
pub fn take_kill_lock(layout: &LogLayout) -> Result<Option<File>> {
    Ok(lock::try_open_exclusive(layout.kill_file(), true)?)
}

pub fn kill_lock_held(layout: &LogLayout) -> Result<bool> {
    Ok(lock::is_locked(layout.kill_file())?)
}

/// Parameters of the promotion watch.
#[derive(Debug, Clone)]
pub struct PromotionWatch {
    pub layout: LogLayout,
    pub service: String,
    pub version: i64,
    pub active_active: bool,
    pub upgrading: bool,
    pub poll: Duration,
    pub spin: SpinPolicy,
}

/// Wait until this secondary holds the current log's lock with the pointers
/// still naming that log.
pub async fn detect_becoming_primary(watch: &PromotionWatch, metadata: &dyn MetadataStore) -> Result<PromotionTicket> {
    let mut spinner = Spinner::new(watch.spin);
    loop {
        let log_no = read_pointer(metadata, &watch.service, keys::LAST_LOG_FILE)?;
        if let Some(file) = lock::try_lock_existing(watch.layout.log(log_no))? {
            let now = read_pointer(metadata, &watch.service, keys::LAST_LOG_FILE)?;
            let version = metadata
                .get_i64(&watch.service, keys::CURRENT_VERSION)
                .map_err(metadata_err)?
                .unwrap_or(watch.version);
            if version > watch.version && !watch.upgrading {
                return Err(AmbrosiaError::VersionMismatch {
                    running: watch.version,
                    stored: version,
                });
            }
            let stale = now != log_no || version != watch.version;
            let killed = watch.active_active && !watch.upgrading && kill_lock_held(&watch.layout)?;
            if !stale && !killed {
                tracing::info!("primary released log {}, promoting", log_no);
                return Ok(PromotionTicket { log_no, file });
            }
            tracing::debug!("lock on log {} is stale (pointer {}, killed {})", log_no, now, killed);
        }
        spinner.spin().await;
        tokio::time::sleep(watch.poll).await;
    }
}
