//! taskdispatch -- priority task dispatch for remote test endpoints, plus
//! packaging of test scripts into deployable archives.
//!
//! The crate provides per-endpoint priority queues with at-most-once claim
//! semantics, a SQLite document store behind a narrow repository trait, a
//! dependency-aware script packager and the HTTP surface exposing them.

pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod model;
pub mod packaging;
pub mod storage;

pub use error::{DispatchError, Result};

use anyhow::Context;

use crate::api::state::AppState;
use crate::config::DispatchConfig;

/// Start the dispatch daemon: open the store and serve the HTTP API until
/// Ctrl-C.
pub async fn serve(config: DispatchConfig) -> anyhow::Result<()> {
    let state = AppState::from_config(&config)?;

    let addr: std::net::SocketAddr = config
        .server
        .listen_address
        .parse()
        .with_context(|| format!("invalid listen address {}", config.server.listen_address))?;
    let app = api::router(state);

    tracing::info!(%addr, scripts = %config.scripts.root.display(), "taskdispatch listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("taskdispatch stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
