use axum::{
    routing::{get, post},
    Router,
};

use super::handlers;
use super::AppState;

/// Creates the main API router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        // Feed
        .route("/movies", get(handlers::movies))
        // Catalog snapshot
        .route("/catalog/search", get(handlers::search_catalog))
        .route("/catalog/new-releases", get(handlers::new_releases))
        .route("/catalog/refresh", post(handlers::refresh_catalog))
        // Enrichment
        .route("/enrichment/refresh", post(handlers::refresh_enrichment))
        .route("/enrichment/:key", get(handlers::enrichment_state))
        // Discovery cursors
        .route("/discovery/:signature", get(handlers::discovery_cursor))
        .with_state(state)
}
