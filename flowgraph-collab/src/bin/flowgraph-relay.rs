//! Standalone relay for pipeline collaboration.
//!
//! Configured through `FLOWGRAPH_RELAY_ADDR` (default `127.0.0.1:9090`) and
//! `FLOWGRAPH_RELAY_DATA` (persistence directory; in-memory when unset).
//! Log verbosity follows `RUST_LOG`.

use flowgraph_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = ServerConfig::from_env();
    log::info!(
        "Starting flowgraph relay on {} (storage: {})",
        config.bind_addr,
        config
            .storage_path
            .as_ref()
            .map_or_else(|| "memory".to_string(), |p| p.display().to_string())
    );

    let server = SyncServer::new(config)?;
    server.run().await
}
