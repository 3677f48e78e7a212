// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use ambrosia_node::config::{NodeArgs, NodeConfig};
use ambrosia_node::errors::NodeError;
use ambrosia_node::telemetry;
use clap::Parser;

#[tokio::main]
async fn main() {
    let config = match NodeConfig::load(NodeArgs::parse()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ambrosia-node: {}", e);
            std::process::exit(2);
        }
    };
    if let Err(e) = telemetry::init_telemetry(config.metrics_listen) {
        eprintln!("ambrosia-node: {}", e);
        std::process::exit(2);
    }
    tracing::info!("starting {} v{}", config.runtime.service_name, config.runtime.current_version);

    match ambrosia_node::run(config).await {
        Ok(()) => {}
        Err(NodeError::Runtime(e)) => ambrosia::error::terminate(&e),
        Err(e) => {
            tracing::error!("node failed: {}", e);
            std::process::exit(1);
        }
    }
}
