//! Pub/sub and snapshot cache relay shared by collab processes.
//!
//! Binds `COLLAB_RELAY_BIND` (default `127.0.0.1:9191`).

use log::{error, info};
use wiki_collab::{CollabConfig, RelayServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match CollabConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    info!("Starting collab relay on {}...", config.relay_bind);
    let server = match RelayServer::bind(&config.relay_bind).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to bind {}: {e}", config.relay_bind);
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Relay stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down collab relay");
        }
    }
}
