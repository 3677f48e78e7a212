// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Node configuration.
//!
//! Built from an optional JSON file, then overridden field by field by
//! command line flags:
//!
//! ```text
//! NodeConfig::default()
//! ↓ --config node.json     (whole file, missing fields keep defaults)
//! ↓ --service-name, --peer name=addr, ...
//! NodeConfig
//! ```

use crate::errors::{NodeError, Result};
use ambrosia::RuntimeConfig;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "ambrosia-node", version, about = "Runs a recoverable service behind the Ambrosia runtime")]
pub struct NodeArgs {
    /// JSON config file to start from.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub service_name: Option<String>,

    /// Directory holding `<service>_<version>/` log and checkpoint files.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    #[arg(long)]
    pub current_version: Option<i64>,

    /// Upgrade to this version on start.
    #[arg(long)]
    pub upgrade_version: Option<i64>,

    #[arg(long)]
    pub active_active: bool,

    #[arg(long)]
    pub log_trigger_size: Option<u64>,

    #[arg(long)]
    pub checkpoint_interval_secs: Option<u64>,

    /// Address peers connect to.
    #[arg(long)]
    pub peer_listen: Option<SocketAddr>,

    /// Address the local service connects to.
    #[arg(long)]
    pub service_listen: Option<SocketAddr>,

    /// Serve Prometheus metrics on this address.
    #[arg(long)]
    pub metrics_listen: Option<SocketAddr>,

    /// File backing the metadata store. Defaults to `<log-dir>/metadata.json`.
    #[arg(long)]
    pub metadata_path: Option<PathBuf>,

    /// Peer address as `name=host:port`. Repeatable.
    #[arg(long = "peer", value_parser = parse_peer)]
    pub peers: Vec<(String, SocketAddr)>,
}

fn parse_peer(s: &str) -> std::result::Result<(String, SocketAddr), String> {
    let (name, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=host:port, got {:?}", s))?;
    if name.is_empty() {
        return Err("peer name is empty".to_string());
    }
    let addr = addr.parse().map_err(|e| format!("bad address {:?}: {}", addr, e))?;
    Ok((name.to_string(), addr))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub runtime: RuntimeConfig,
    pub peer_listen: SocketAddr,
    pub service_listen: SocketAddr,
    pub metrics_listen: Option<SocketAddr>,
    pub metadata_path: Option<PathBuf>,
    pub peers: BTreeMap<String, SocketAddr>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeConfig::default(),
            peer_listen: SocketAddr::from(([127, 0, 0, 1], 2500)),
            service_listen: SocketAddr::from(([127, 0, 0, 1], 2600)),
            metrics_listen: None,
            metadata_path: None,
            peers: BTreeMap::new(),
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| NodeError::ConfigFile {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn load(args: NodeArgs) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply(args);
        config.runtime.validate()?;
        if config.peer_listen == config.service_listen {
            return Err(NodeError::Config(format!(
                "peer and service listeners share {}",
                config.peer_listen
            )));
        }
        Ok(config)
    }

    fn apply(&mut self, args: NodeArgs) {
        let rt = &mut self.runtime;
        if let Some(v) = args.service_name {
            rt.service_name = v;
        }
        if let Some(v) = args.log_dir {
            rt.log_dir = v;
        }
        if let Some(v) = args.current_version {
            rt.current_version = v;
            // Without an explicit upgrade target the node is not upgrading.
            if args.upgrade_version.is_none() {
                rt.upgrade_version = v;
            }
        }
        if let Some(v) = args.upgrade_version {
            rt.upgrade_version = v;
        }
        if args.active_active {
            rt.active_active = true;
        }
        if let Some(v) = args.log_trigger_size {
            rt.log_trigger_size = v;
        }
        if let Some(v) = args.checkpoint_interval_secs {
            rt.checkpoint_interval_secs = Some(v);
        }
        if let Some(v) = args.peer_listen {
            self.peer_listen = v;
        }
        if let Some(v) = args.service_listen {
            self.service_listen = v;
        }
        if let Some(v) = args.metrics_listen {
            self.metrics_listen = Some(v);
        }
        if let Some(v) = args.metadata_path {
            self.metadata_path = Some(v);
        }
        self.peers.extend(args.peers);
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.metadata_path
            .clone()
            .unwrap_or_else(|| self.runtime.log_dir.join("metadata.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_flags_override_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.json");
        std::fs::write(
            &path,
            r#"{
                "runtime": { "service_name": "from-file", "active_active": true, "tail_poll_ms": 7 },
                "peers": { "bob": "127.0.0.1:4000" }
            }"#,
        )
        .unwrap();

        let args = NodeArgs::parse_from([
            "ambrosia-node",
            "--config",
            path.to_str().unwrap(),
            "--service-name",
            "alice",
            "--peer",
            "carol=127.0.0.1:4001",
        ]);
        let config = NodeConfig::load(args).unwrap();
        assert_eq!(config.runtime.service_name, "alice");
        assert!(config.runtime.active_active);
        assert_eq!(config.runtime.tail_poll_ms, 7);
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.peers["carol"], "127.0.0.1:4001".parse().unwrap());
        assert_eq!(config.metadata_path(), config.runtime.log_dir.join("metadata.json"));
    }

    #[test]
    fn test_current_version_alone_means_no_upgrade() {
        let args = NodeArgs::parse_from(["ambrosia-node", "--current-version", "3"]);
        let config = NodeConfig::load(args).unwrap();
        assert!(!config.runtime.is_upgrading());

        let args = NodeArgs::parse_from(["ambrosia-node", "--current-version", "3", "--upgrade-version", "4"]);
        assert!(NodeConfig::load(args).unwrap().runtime.is_upgrading());
    }

    #[test]
    fn test_bad_peer_is_rejected() {
        assert!(NodeArgs::try_parse_from(["ambrosia-node", "--peer", "nobody"]).is_err());
        assert!(NodeArgs::try_parse_from(["ambrosia-node", "--peer", "=127.0.0.1:1"]).is_err());
    }

    #[test]
    fn test_shared_listener_is_rejected() {
        let args = NodeArgs::parse_from([
            "ambrosia-node",
            "--peer-listen",
            "127.0.0.1:5000",
            "--service-listen",
            "127.0.0.1:5000",
        ]);
        assert!(matches!(NodeConfig::load(args), Err(NodeError::Config(_))));
    }
}
