use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use vigil_core::{
    GetScansQuery, ScanSnapshot,
    scan::{ScanId, ScanRequest},
};

use crate::infra::{app_state::AppState, errors::AppResult};

/// Query string accepted by the status endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct StatusParams {
    pub details: Option<bool>,
    pub pop_results: Option<bool>,
    pub max_results: Option<usize>,
}

impl StatusParams {
    fn into_query(self, scan_id: Option<ScanId>) -> GetScansQuery {
        let defaults = GetScansQuery::default();
        GetScansQuery {
            scan_id,
            details: self.details.unwrap_or(defaults.details),
            pop_results: self.pop_results.unwrap_or(defaults.pop_results),
            max_results: self.max_results,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartScanResponse {
    pub id: ScanId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScanHostsResponse {
    pub finished: Vec<String>,
    pub unfinished: Vec<String>,
}

pub async fn start_scan_handler(
    State(state): State<AppState>,
    Json(request): Json<ScanRequest>,
) -> AppResult<impl IntoResponse> {
    let id = state.daemon().start_scan(request).await?;
    Ok((StatusCode::CREATED, Json(StartScanResponse { id })))
}

pub async fn list_scans_handler(
    State(state): State<AppState>,
    Query(params): Query<StatusParams>,
) -> AppResult<Json<Vec<ScanSnapshot>>> {
    let scans = state.daemon().get_scans(params.into_query(None)).await?;
    Ok(Json(scans))
}

pub async fn get_scan_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<StatusParams>,
) -> AppResult<Json<ScanSnapshot>> {
    let query = params.into_query(Some(ScanId::new(id.clone())));
    let mut scans = state.daemon().get_scans(query).await?;
    // A single-id query yields exactly one snapshot or NotFound.
    match scans.pop() {
        Some(snapshot) => Ok(Json(snapshot)),
        None => Err(vigil_core::ScanError::NotFound(ScanId::new(id)).into()),
    }
}

pub async fn stop_scan_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    state.daemon().stop_scan(&ScanId::new(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_scan_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    state.daemon().delete_scan(&ScanId::new(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn scan_hosts_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<ScanHostsResponse>> {
    let id = ScanId::new(id);
    let daemon = state.daemon();
    Ok(Json(ScanHostsResponse {
        finished: daemon.get_scan_finished_hosts(&id).await?,
        unfinished: daemon.get_scan_unfinished_hosts(&id).await?,
    }))
}
