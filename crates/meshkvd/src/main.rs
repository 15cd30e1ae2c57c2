//! meshkvd - replicated key-value mesh daemon
//!
//! Runs a single node on a QUIC endpoint until interrupted.

use clap::Parser;
use meshkvd::config::Config;
use meshkvd::logging::init_logging;
use meshkvd::node::Node;
use std::process::ExitCode;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration
    let config = Config::parse();
    init_logging(&config.log_format, config.verbose);

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {:#}", e);
        return ExitCode::FAILURE;
    }

    info!(
        "meshkvd v{} - replicated key-value mesh node",
        env!("CARGO_PKG_VERSION")
    );

    let node = match Node::start(config.into_node_config()).await {
        Ok(node) => node,
        Err(e) => {
            error!("Failed to start node: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let info = node.info();
    info!("Node id: {}", info.node_id);
    if let Some(addr) = &info.listen_address {
        info!("Dial address: {}@{}", info.node_id, addr);
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to wait for shutdown signal: {}", e);
    }
    info!("Received shutdown signal");
    node.stop().await;

    ExitCode::SUCCESS
}
