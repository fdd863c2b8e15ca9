//! Standalone relay server for presence channels and collaborative rooms.
//!
//! `SCRIBE_RELAY_ADDR` overrides the bind address; `RUST_LOG` controls
//! logging.

use log::info;
use scribe_collab::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let mut config = RelayConfig::default();
    if let Ok(addr) = std::env::var("SCRIBE_RELAY_ADDR") {
        config.bind_addr = addr;
    }

    info!("Starting Scribe relay...");
    let server = RelayServer::bind(config).await?;
    server.run().await
}
