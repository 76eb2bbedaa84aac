//! tabvault-relay binary entry point.
//!
//! Usage:
//! ```bash
//! tabvault-relay --config relay.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use tabvault_relay::cleanup::spawn_cleanup_task;
use tabvault_relay::config::Config;
use tabvault_relay::error::RelayError;
use tabvault_relay::http::{build_router, health};
use tabvault_relay::server::RelayServer;
use tabvault_relay::storage::SqliteStore;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), RelayError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    health::init_start_time();

    let config_path = get_config_path();
    let config = if config_path.exists() {
        Config::from_file(&config_path)?
    } else {
        info!(path = %config_path.display(), "no config file, using defaults");
        Config::default()
    };

    let store = SqliteStore::new(&config.storage.database).await?;
    info!(database = %config.storage.database.display(), "storage opened");

    let bind_address = config.server.bind_address.clone();
    let cleanup_config = config.cleanup.clone();
    let storage_config = config.storage.clone();
    let server = Arc::new(RelayServer::new(config, store));

    spawn_cleanup_task(server.store_arc(), cleanup_config, storage_config);

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!(
        address = %bind_address,
        version = env!("CARGO_PKG_VERSION"),
        "tabvault-relay listening"
    );
    axum::serve(listener, build_router(server)).await?;
    Ok(())
}

fn get_config_path() -> PathBuf {
    std::env::args()
        .skip_while(|arg| arg != "--config")
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("relay.toml"))
}
