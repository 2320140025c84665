//! Read-only admin HTTP endpoint.
//!
//! Runs on the small tokio runtime owned by the binary; the data path never
//! touches it.

pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};

use self::handlers::*;
use crate::lifecycle::Shutdown;
use crate::net::LinkContext;

pub fn setup_admin_router(ctx: Arc<LinkContext>) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/threads", get(get_threads))
        .route("/admin/connections", get(get_connections))
        .with_state(ctx)
}

/// Serve the admin router until shutdown is triggered.
pub async fn serve(
    addr: SocketAddr,
    ctx: Arc<LinkContext>,
    shutdown: Shutdown,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(address = %listener.local_addr()?, "Admin endpoint started");

    axum::serve(listener, setup_admin_router(ctx))
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
}
