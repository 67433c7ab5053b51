// API router

pub mod common;
pub mod runs;
pub mod workers;

use axum::routing::{delete, get, post};
use axum::Router;

use crate::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/workers", post(workers::register))
        .route("/api/v1/workers/:id/heartbeat", post(workers::heartbeat))
        .route("/api/v1/workers/:id", delete(workers::unregister))
        .route("/api/v1/workers/:id/claim", post(workers::claim))
        .route("/api/v1/workers/:id/complete", post(workers::complete))
        .route("/api/v1/runs", post(runs::start))
        .route("/api/v1/runs/:id", get(runs::get))
        .route("/api/v1/runs/:id/pause", post(runs::pause))
        .route("/api/v1/runs/:id/resume", post(runs::resume))
        .route("/api/v1/runs/:id/cancel", post(runs::cancel))
        .with_state(state)
}
