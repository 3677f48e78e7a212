// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use crate::errors::{NodeError, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub const DEFAULT_FILTER: &str = "ambrosia=info,ambrosia_node=info";

/// Initialize logs and metrics. With `metrics_listen` set, Prometheus
/// scrapes are served there; otherwise metrics are only rendered on demand.
pub fn init_telemetry(metrics_listen: Option<SocketAddr>) -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_FILTER.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| NodeError::Telemetry(e.to_string()))?;

    match metrics_listen {
        Some(addr) => {
            PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .map_err(|e| NodeError::Telemetry(e.to_string()))?;
            tracing::info!("serving metrics on {}", addr);
        }
        None => {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(|e| NodeError::Telemetry(e.to_string()))?;
            if PROM_HANDLE.set(handle).is_err() {
                tracing::warn!("Prometheus handle already set. Telemetry re-initialized?");
            }
        }
    }

    metrics::describe_counter!("ambrosia_commits_total", "Log records written by the committer");
    metrics::describe_histogram!("ambrosia_commit_bytes", "Bytes per committed log record");
    metrics::describe_counter!("ambrosia_replay_records_total", "Log records applied during recovery");
    metrics::describe_counter!("ambrosia_checkpoints_total", "Checkpoints written");
    metrics::describe_counter!("ambrosia_log_rotations_total", "Log files started");
    metrics::describe_gauge!("ambrosia_role", "0 primary, 1 secondary, 2 checkpointer");

    metrics::gauge!("ambrosia_node_up", 1.0);
    Ok(())
}

/// Current metrics in the Prometheus text format.
pub fn get_metrics() -> String {
    if let Some(handle) = PROM_HANDLE.get() {
        handle.render()
    } else {
        "# metrics not initialized".to_string()
    }
}
