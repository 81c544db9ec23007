//! Whiteboard room server.
//!
//! Configuration comes from `WHITEBOARD_*` environment variables (optionally
//! via a `.env` file); log filtering from `RUST_LOG`, default `info`.

mod config;

use log::{info, warn};
use whiteboard_sync::SyncServer;

use config::Config;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let loaded = Config::load();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            warn!("{e}; falling back to defaults");
            Config::default()
        }
    };

    let server_config = config.server_config();
    info!(
        "Starting whiteboard server (max {} participants per room, broadcast capacity {})",
        server_config.max_participants_per_room, server_config.broadcast_capacity
    );

    SyncServer::new(server_config).run().await
}
