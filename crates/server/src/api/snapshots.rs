//! Snapshot and firmware catalog handlers.

use axum::{
    extract::{Path, Query, State},
    http::header,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use fleetguard_core::{FirmwareImage, Snapshot};

use super::error::{dispatch_error, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct DiffParams {
    pub from: String,
    pub to: String,
}

pub async fn get_snapshot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Snapshot>> {
    state
        .dispatcher()
        .get_snapshot(&id)
        .map(Json)
        .map_err(dispatch_error)
}

/// Raw configuration text, verified against its recorded hash
pub async fn get_snapshot_content(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let content = state
        .dispatcher()
        .get_snapshot_content(&id)
        .map_err(dispatch_error)?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], content))
}

/// Unified diff between two snapshots
pub async fn diff_snapshots(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DiffParams>,
) -> ApiResult<impl IntoResponse> {
    let diff = state
        .dispatcher()
        .diff_snapshots(&params.from, &params.to)
        .map_err(dispatch_error)?;
    Ok(([(header::CONTENT_TYPE, "text/x-diff; charset=utf-8")], diff))
}

pub async fn list_firmware(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<FirmwareImage>>> {
    state
        .dispatcher()
        .list_firmware()
        .map(Json)
        .map_err(dispatch_error)
}
