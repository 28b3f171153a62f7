use axum::{
    Router,
    routing::{get, post},
};

use crate::{
    AppState,
    handlers::scans::{
        delete_scan_handler, get_scan_handler, list_scans_handler, scan_hosts_handler,
        start_scan_handler, stop_scan_handler,
    },
};

pub fn create_v1_router() -> Router<AppState> {
    Router::new()
        .route("/scans", post(start_scan_handler).get(list_scans_handler))
        .route(
            "/scans/{id}",
            get(get_scan_handler).delete(delete_scan_handler),
        )
        .route("/scans/{id}/stop", post(stop_scan_handler))
        .route("/scans/{id}/hosts", get(scan_hosts_handler))
}
