//! Router configuration for the API server.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use super::handlers;
use super::AppState;

/// Create the main router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/snapshots", post(handlers::create_snapshot))
        .route("/snapshots/:snapshot_id", get(handlers::get_snapshot))
        .route("/webhook", post(handlers::webhook))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
