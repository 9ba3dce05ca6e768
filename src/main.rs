//! collab-relay - reference relay for collaborative document editing.
//!
//! Serves the JSON WebSocket protocol at `/ws` and a health check at
//! `/health`. Documents live in memory until their last session leaves.

use anyhow::Context;
use std::{net::SocketAddr, sync::Arc};
use tracing::info;

use collab_core::relay::{serve, RelayServer};
use collab_core::sync::protocol::PROTOCOL_VERSION;
use collab_core::RelayConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collab_core=info,collab_relay=info,tower_http=info".into()),
        )
        .init();

    let config = RelayConfig::from_env();
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let server = Arc::new(RelayServer::new(config));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    info!("collab relay v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Protocol version: {}", PROTOCOL_VERSION);
    info!("   WebSocket: ws://{}/ws", addr);
    info!("   Health check: http://{}/health", addr);

    serve(listener, server).await.context("relay server error")?;
    Ok(())
}
