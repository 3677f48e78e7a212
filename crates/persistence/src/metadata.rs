// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! External metadata store: a handful of small string values per service
//! (current version, last committed checkpoint, last log file).

use crate::error::{PersistenceError, Result};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

pub mod keys {
    pub const CURRENT_VERSION: &str = "current_version";
    pub const LAST_COMMITTED_CHECKPOINT: &str = "last_committed_checkpoint";
    pub const LAST_LOG_FILE: &str = "last_log_file";
}

pub trait MetadataStore: Send + Sync {
    fn get(&self, service: &str, key: &str) -> Result<Option<String>>;
    fn set(&self, service: &str, key: &str, value: &str) -> Result<()>;

    fn get_i64(&self, service: &str, key: &str) -> Result<Option<i64>> {
        match self.get(service, key)? {
            Some(raw) => raw
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|e| PersistenceError::Metadata(format!("{}/{} = {:?}: {}", service, key, raw, e))),
            None => Ok(None),
        }
    }

    fn set_i64(&self, service: &str, key: &str, value: i64) -> Result<()> {
        self.set(service, key, &value.to_string())
    }
}

fn scoped(service: &str, key: &str) -> String {
    format!("{}/{}", service, key)
}

fn poisoned<T>(_: T) -> PersistenceError {
    PersistenceError::Metadata("metadata lock poisoned".into())
}

/// In-process store for tests and single-machine runs.
#[derive(Default)]
pub struct MemoryMetadataStore {
    data: RwLock<BTreeMap<String, String>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemoryMetadataStore {
    fn get(&self, service: &str, key: &str) -> Result<Option<String>> {
        let guard = self.data.read().map_err(poisoned)?;
        Ok(guard.get(&scoped(service, key)).cloned())
    }

    fn set(&self, service: &str, key: &str, value: &str) -> Result<()> {
        let mut guard = self.data.write().map_err(poisoned)?;
        guard.insert(scoped(service, key), value.to_string());
        Ok(())
    }
}

/// Store backed by a `key=value` text file. Every `set` rewrites the file
/// through a temporary and an atomic rename, so readers in other processes
/// never see a half-written file.
pub struct FileMetadataStore {
    path: PathBuf,
    io_lock: RwLock<()>,
}

impl FileMetadataStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            io_lock: RwLock::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        let mut map = BTreeMap::new();
        for (n, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let (k, v) = line
                .split_once('=')
                .ok_or_else(|| PersistenceError::Metadata(format!("{}:{}: missing '='", self.path.display(), n + 1)))?;
            map.insert(k.to_string(), v.to_string());
        }
        Ok(map)
    }

    fn store(&self, map: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        let mut file = File::create(&tmp)?;
        for (k, v) in map {
            writeln!(file, "{}={}", k, v)?;
        }
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl MetadataStore for FileMetadataStore {
    fn get(&self, service: &str, key: &str) -> Result<Option<String>> {
        let _guard = self.io_lock.read().map_err(poisoned)?;
        Ok(self.load()?.remove(&scoped(service, key)))
    }

    fn set(&self, service: &str, key: &str, value: &str) -> Result<()> {
        let _guard = self.io_lock.write().map_err(poisoned)?;
        let mut map = self.load()?;
        map.insert(scoped(service, key), value.to_string());
        self.store(&map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_memory_store_scopes_by_service() {
        let store = MemoryMetadataStore::new();
        store.set_i64("a", keys::LAST_LOG_FILE, 4).unwrap();
        assert_eq!(store.get_i64("a", keys::LAST_LOG_FILE).unwrap(), Some(4));
        assert_eq!(store.get_i64("b", keys::LAST_LOG_FILE).unwrap(), None);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta").join("store.txt");
        let store = FileMetadataStore::new(&path);
        store.set("bank", keys::CURRENT_VERSION, "2").unwrap();
        store.set_i64("bank", keys::LAST_COMMITTED_CHECKPOINT, 7).unwrap();
        drop(store);

        let store = FileMetadataStore::new(&path);
        assert_eq!(store.get("bank", keys::CURRENT_VERSION).unwrap().as_deref(), Some("2"));
        assert_eq!(store.get_i64("bank", keys::LAST_COMMITTED_CHECKPOINT).unwrap(), Some(7));
    }

    #[test]
    fn test_garbage_number_is_an_error() {
        let store = MemoryMetadataStore::new();
        store.set("bank", keys::LAST_LOG_FILE, "seven").unwrap();
        assert!(store.get_i64("bank", keys::LAST_LOG_FILE).is_err());
    }
}
