// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Runtime configuration.

use crate::error::{AmbrosiaError, Result};
use crate::spin::SpinPolicy;
use ambrosia_persistence::LogLayout;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default size of one commit buffer (two are allocated).
pub const DEFAULT_MAX_COMMIT_BUFFER: usize = 1024 * 1024;

/// Default log size that triggers rotation.
pub const DEFAULT_LOG_TRIGGER_SIZE: u64 = 1024 * 1024 * 1024;

/// Default output buffer page size.
pub const DEFAULT_PAGE_SIZE: usize = 64 * 1024;

/// Default number of pooled output pages.
pub const DEFAULT_PAGE_POOL_SIZE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub service_name: String,
    pub log_dir: PathBuf,
    pub current_version: i64,
    /// Differs from `current_version` while upgrading.
    pub upgrade_version: i64,
    pub active_active: bool,
    pub max_commit_buffer: usize,
    pub log_trigger_size: u64,
    pub page_size: usize,
    pub page_pool_size: usize,
    pub spin: SpinPolicy,
    /// Seconds between periodic checkpoints. `None` checkpoints only on rotation.
    pub checkpoint_interval_secs: Option<u64>,
    /// How often the primary checks the log size and the kill lock.
    pub housekeeping_interval_ms: u64,
    /// How long a secondary waits at the end of the log before reading again.
    pub tail_poll_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            service_name: "service".to_string(),
            log_dir: PathBuf::from("./ambrosia_logs"),
            current_version: 0,
            upgrade_version: 0,
            active_active: false,
            max_commit_buffer: DEFAULT_MAX_COMMIT_BUFFER,
            log_trigger_size: DEFAULT_LOG_TRIGGER_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
            page_pool_size: DEFAULT_PAGE_POOL_SIZE,
            spin: SpinPolicy::default(),
            checkpoint_interval_secs: None,
            housekeeping_interval_ms: 500,
            tail_poll_ms: 20,
        }
    }
}

impl RuntimeConfig {
    pub fn new(service_name: impl Into<String>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            service_name: service_name.into(),
            log_dir: log_dir.into(),
            ..Self::default()
        }
    }

    pub fn is_upgrading(&self) -> bool {
        self.upgrade_version != self.current_version
    }

    /// Files of the version currently running.
    pub fn layout(&self) -> LogLayout {
        LogLayout::new(&self.log_dir, &self.service_name, self.current_version)
    }

    /// Files of the version being upgraded to.
    pub fn upgrade_layout(&self) -> LogLayout {
        LogLayout::new(&self.log_dir, &self.service_name, self.upgrade_version)
    }

    pub fn checkpoint_interval(&self) -> Option<Duration> {
        self.checkpoint_interval_secs.filter(|s| *s > 0).map(Duration::from_secs)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms.max(1))
    }

    pub fn tail_poll(&self) -> Duration {
        Duration::from_millis(self.tail_poll_ms.max(1))
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |why: &str| Err(AmbrosiaError::Config(why.to_string()));
        if self.service_name.is_empty() || self.service_name.contains(['/', '\\']) {
            return bad("service name must be a non-empty file name");
        }
        if self.max_commit_buffer < 64 || self.max_commit_buffer > (u32::MAX >> 1) as usize {
            return bad("max_commit_buffer must be between 64 bytes and 2 GiB");
        }
        if self.page_size == 0 {
            return bad("page_size must be positive");
        }
        if self.page_pool_size == 0 {
            return bad("page_pool_size must be positive");
        }
        if self.upgrade_version < self.current_version {
            return bad("upgrade_version is older than current_version");
        }
        Ok(())
    }
}
