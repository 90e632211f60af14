//! Blackboard relay server.
//!
//! Configuration comes from `BLACKBOARD_*` environment variables and log
//! filtering from `RUST_LOG` (default `info`).

use std::process::ExitCode;

use blackboard_relay::{RelayServer, ServerConfig};
use log::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting Blackboard relay...");

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let server = match RelayServer::bind(config).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start relay: {e}");
            return ExitCode::FAILURE;
        }
    };

    match server.endpoint_url() {
        Ok(url) => info!("Clients connect to {url}"),
        Err(e) => error!("Could not resolve endpoint address: {e}"),
    }

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Accept loop failed: {e}");
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats();
            info!(
                "Shutting down: {} connections served, {} messages relayed, {} rejected",
                stats.total_connections, stats.total_messages, stats.rejected_messages
            );
        }
    }

    ExitCode::SUCCESS
}
