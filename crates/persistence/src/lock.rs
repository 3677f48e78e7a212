// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Exclusive file locks used for role arbitration.
//!
//! Holding the advisory lock on a file is the only coordination primitive
//! between replicas. The lock lives as long as the returned `File`.

use crate::error::Result;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error().is_some() && err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Open `path` for appending without truncating and try to take its
/// exclusive lock. `Ok(None)` means another handle holds the lock.
pub fn try_open_exclusive(path: impl AsRef<Path>, create: bool) -> Result<Option<File>> {
    let file = OpenOptions::new()
        .create(create)
        .read(true)
        .append(true)
        .open(path.as_ref())?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(file)),
        Err(e) if is_contended(&e) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Like [`try_open_exclusive`] but only succeeds when the file exists.
pub fn try_lock_existing(path: impl AsRef<Path>) -> Result<Option<File>> {
    match try_open_exclusive(path, false) {
        Err(crate::PersistenceError::IoError(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        other => other,
    }
}

/// True if some handle currently holds the lock on `path`.
pub fn is_locked(path: impl AsRef<Path>) -> Result<bool> {
    if !path.as_ref().exists() {
        return Ok(false);
    }
    match try_lock_existing(path)? {
        Some(file) => {
            file.unlock()?;
            Ok(false)
        }
        None => Ok(true),
    }
}
