//! scribe-relay: WebSocket room relay for collaborative editing sessions.
//!
//! Configured from `SCRIBE_RELAY_HOST`, `SCRIBE_RELAY_PORT` and
//! `SCRIBE_RELAY_MAX_PEERS`; log level from `RUST_LOG`.

use log::info;
use scribe_collab::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = RelayConfig::from_env();
    info!(
        "Starting scribe relay on {} (max {} peers per room)",
        config.bind_addr, config.max_peers_per_room
    );

    let server = RelayServer::new(config);
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}
