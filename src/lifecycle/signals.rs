//! OS signal handling.
//!
//! # Responsibilities
//! - Wait for SIGINT (Ctrl-C) or SIGTERM
//! - Stop the listener so the accept loop returns and draining begins
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe) on the admin runtime
//! - A second signal is not special-cased; the drain timeout bounds shutdown

use crate::net::ListenerHandle;

/// Resolve on the first SIGINT or SIGTERM.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}

/// Stop the listener on the first shutdown signal.
pub async fn stop_on_signal(handle: ListenerHandle) {
    wait_for_signal().await;
    tracing::info!("Shutdown signal received, stopping listener");
    // The wake-up connect blocks briefly.
    let _ = tokio::task::spawn_blocking(move || handle.stop()).await;
}
