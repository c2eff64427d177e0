//! Codepad relay: hosts one collaborative room per document id.
//!
//! Configured from the environment:
//!
//! - `CODEPAD_BIND_ADDR` (default `127.0.0.1:8000`)
//! - `CODEPAD_MAX_PEERS` (default 100 per room)
//! - `RUST_LOG` for log filtering

use log::info;

use codepad_collab::server::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig::from_env();
    info!(
        "Starting codepad relay on {} (max {} peers per room)",
        config.bind_addr, config.max_peers_per_room
    );

    let server = SyncServer::new(config);
    if let Err(e) = server.run().await {
        log::error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
