// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use crate::error::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// On-disk layout of one service version:
///
/// ```text
/// <log_dir>/<service>_<version>/
///     <service>_chkpt<N>
///     <service>_log<N>
///     <service>_killFile
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLayout {
    root: PathBuf,
    service: String,
}

impl LogLayout {
    pub fn new(log_dir: impl AsRef<Path>, service: &str, version: i64) -> Self {
        Self {
            root: log_dir.as_ref().join(format!("{}_{}", service, version)),
            service: service.to_string(),
        }
    }

    /// Wrap a directory that already is a `<service>_<version>` folder.
    pub fn at(root: impl AsRef<Path>, service: &str) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            service: service.to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.root
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    pub fn dir_exists(&self) -> bool {
        self.root.is_dir()
    }

    pub fn checkpoint(&self, n: u64) -> PathBuf {
        self.root.join(format!("{}_chkpt{}", self.service, n))
    }

    pub fn log(&self, n: u64) -> PathBuf {
        self.root.join(format!("{}_log{}", self.service, n))
    }

    pub fn kill_file(&self) -> PathBuf {
        self.root.join(format!("{}_killFile", self.service))
    }

    pub fn checkpoint_exists(&self, n: u64) -> bool {
        self.checkpoint(n).is_file()
    }

    pub fn log_exists(&self, n: u64) -> bool {
        self.log(n).is_file()
    }

    pub fn checkpoint_numbers(&self) -> Result<Vec<u64>> {
        self.numbered(&format!("{}_chkpt", self.service))
    }

    pub fn log_numbers(&self) -> Result<Vec<u64>> {
        self.numbered(&format!("{}_log", self.service))
    }

    fn numbered(&self, prefix: &str) -> Result<Vec<u64>> {
        let mut found = Vec::new();
        if !self.dir_exists() {
            return Ok(found);
        }
        for entry in fs::read_dir(&self.root)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(n) = name.strip_prefix(prefix).and_then(|rest| rest.parse::<u64>().ok()) {
                found.push(n);
            }
        }
        found.sort_unstable();
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_names() {
        let layout = LogLayout::new("/logs", "bank", 3);
        assert_eq!(layout.dir(), Path::new("/logs/bank_3"));
        assert_eq!(layout.checkpoint(2), Path::new("/logs/bank_3/bank_chkpt2"));
        assert_eq!(layout.log(7), Path::new("/logs/bank_3/bank_log7"));
        assert_eq!(layout.kill_file(), Path::new("/logs/bank_3/bank_killFile"));
    }

    #[test]
    fn test_lists_numbered_files() {
        let dir = tempdir().unwrap();
        let layout = LogLayout::new(dir.path(), "bank", 0);
        assert!(layout.log_numbers().unwrap().is_empty());
        layout.ensure_dir().unwrap();
        for n in [3, 1, 2] {
            fs::write(layout.log(n), b"").unwrap();
        }
        fs::write(layout.checkpoint(1), b"").unwrap();
        fs::write(layout.kill_file(), b"").unwrap();
        assert_eq!(layout.log_numbers().unwrap(), vec![1, 2, 3]);
        assert_eq!(layout.checkpoint_numbers().unwrap(), vec![1]);
    }
}
