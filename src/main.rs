//! Snippet Collab server.
//!
//! Serves the sync protocol over WebSocket and a small inspection API.
//! Configuration comes from the environment, see [`ServerConfig`].

use anyhow::Context;
use std::sync::Arc;
use tracing::{info, warn};

use snippet_collab::http::{router, AppState};
use snippet_collab::storage::{MemoryStore, Persistence, SledStore};
use snippet_collab::sync::protocol::PROTOCOL_VERSION;
use snippet_collab::sync::SyncServer;
use snippet_collab::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "snippet_collab=info,tower_http=info".into()),
        )
        .init();

    let config = ServerConfig::from_env().context("Invalid configuration")?;

    // Initialize storage
    let store: Arc<dyn Persistence> = match config.storage_config() {
        Some(storage_config) => {
            info!("Initializing storage at: {}", storage_config.path);
            Arc::new(SledStore::open(storage_config).context("Failed to open storage")?)
        }
        None => {
            warn!("STORAGE_PATH not set - rooms are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let access = config
        .access_policy()
        .context("Failed to set up access policy")?;
    if config.auth.is_none() {
        warn!("AUTH_SECRET not set - every peer may join any room");
    }

    let sync_server = Arc::new(SyncServer::new(store, access, config.sync.clone()));
    let background = sync_server.clone().start_background_tasks();
    let app = router(Arc::new(AppState::new(sync_server.clone())));

    let addr = config.bind_addr;
    info!("Snippet Collab server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Protocol version: {}", PROTOCOL_VERSION);
    info!("   Listening on: http://{}", addr);
    info!("   WebSocket: ws://{}/ws/:room_id", addr);
    info!("   Health check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Shutting down, flushing rooms");
    sync_server.shutdown();
    let flushed = sync_server.flush_all().await;
    info!("Flushed {} rooms", flushed);
    background.wait().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
