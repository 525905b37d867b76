//! HTTP API for the versioned document store.
//!
//! Thin layer over the snapshot orchestrator: requests create snapshots
//! and enqueue jobs, reads return snapshot state. Processing happens in
//! the worker pool, never on the request path.

mod handlers;
mod routes;

pub use routes::create_router;

use std::sync::Arc;

use crate::config::Settings;
use crate::orchestrator::SnapshotService;

/// Shared state for the API server.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SnapshotService>,
}

/// Start the API server.
pub async fn serve(settings: &Settings, service: Arc<SnapshotService>) -> anyhow::Result<()> {
    let app = create_router(AppState { service });

    let addr = settings.bind_addr();
    tracing::info!("starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
