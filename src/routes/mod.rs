pub mod crawl;
pub mod error;
pub mod health;
pub mod metrics;

use axum::routing::{get, post};
use axum::Router;

use crate::app_state::AppState;

/// Job and health endpoints. Layers and `/metrics` are added by the server.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health::health_check))
        .route("/crawl", post(crawl::submit_crawl))
        .route("/crawl/{id}", get(crawl::get_crawl))
        .with_state(state)
}
