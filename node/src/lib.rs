// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! The Ambrosia node: one runtime, its TCP peer links and the link to the
//! local service, configured from the command line.
pub mod broker;
pub mod config;
pub mod errors;
pub mod local;
pub mod telemetry;

use crate::broker::TcpBroker;
use crate::config::NodeConfig;
use crate::errors::{NodeError, Result};
use ambrosia::{AmbrosiaError, Runtime};
use ambrosia_persistence::FileMetadataStore;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

fn local_service_ended(joined: std::result::Result<ambrosia::Result<()>, tokio::task::JoinError>) -> NodeError {
    match joined {
        Ok(Err(e)) => NodeError::Runtime(e),
        Ok(Ok(())) => NodeError::Runtime(AmbrosiaError::ServiceGone("local link closed".to_string())),
        Err(e) => NodeError::Runtime(AmbrosiaError::ServiceGone(format!("local link task: {}", e))),
    }
}

/// Run until a fatal fault or Ctrl-C.
pub async fn run(config: NodeConfig) -> Result<()> {
    std::fs::create_dir_all(&config.runtime.log_dir)?;
    let metadata_path = config.metadata_path();
    if let Some(parent) = metadata_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let metadata = Arc::new(FileMetadataStore::new(&metadata_path));
    let peers = Arc::new(TcpBroker::new(config.peers.clone()));

    let (_, inbound) = broker::listen(config.peer_listen).await?;
    let service_listener = TcpListener::bind(config.service_listen).await?;
    tracing::info!("waiting for the local service on {}", config.service_listen);

    let (prepared, endpoint) = Runtime::prepare(config.runtime.clone(), metadata, peers)?;
    let mut local: JoinHandle<ambrosia::Result<()>> = tokio::spawn(local::serve_local(service_listener, endpoint));

    let runtime = tokio::select! {
        started = prepared.start() => started?,
        joined = &mut local => return Err(local_service_ended(joined)),
    };
    runtime.serve(inbound);

    tokio::select! {
        fault = runtime.wait_fatal() => Err(NodeError::Runtime(fault)),
        joined = &mut local => Err(local_service_ended(joined)),
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("interrupted, shutting down");
            runtime.shutdown().await?;
            Ok(())
        }
    }
}
