pub mod v1;

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::{AppState, handlers::health::health_handler};

/// Create the main API router with all versions
pub fn create_api_router() -> Router<AppState> {
    Router::new().nest("/api/v1", v1::create_v1_router())
}

/// Full application: versioned API, health check and request tracing.
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .merge(create_api_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
