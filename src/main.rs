//! Noughts Game Server
//!
//! Authoritative session server for noughts and crosses.
//! Configuration comes from the environment; see each `*Config::from_env`.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use noughts::{
    network::{GameServer, ServerConfig},
    GameService, ServiceConfig, VERSION,
};

#[cfg(feature = "debug-tracing")]
const DEFAULT_FILTER: &str = "debug";
#[cfg(not(feature = "debug-tracing"))]
const DEFAULT_FILTER: &str = "info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Noughts Server v{}", VERSION);

    let server_config = ServerConfig::from_env();
    let service_config = ServiceConfig::from_env();
    info!(
        bind_addr = %server_config.bind_addr,
        max_connections = server_config.max_connections,
        strategy = ?service_config.strategy,
        finished_grace_secs = service_config.registry.finished_grace.as_secs(),
        idle_ttl_secs = service_config.registry.idle_ttl.as_secs(),
        "Configuration loaded"
    );

    let service = Arc::new(GameService::new(service_config));
    let server = Arc::new(GameServer::new(server_config, service));

    let signal_server = server.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, shutting down");
                signal_server.shutdown();
            }
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    server.run().await.context("game server failed")?;

    info!("Server stopped");
    Ok(())
}
