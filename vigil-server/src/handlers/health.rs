use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde_json::json;

use crate::infra::app_state::AppState;

pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let daemon = state.daemon();
    let kb_lost = daemon.fatal_token().is_cancelled();
    let status = if kb_lost {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        status,
        Json(json!({
            "status": if kb_lost { "unhealthy" } else { "healthy" },
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION"),
            "scans": daemon.collection().len().await,
        })),
    )
}
