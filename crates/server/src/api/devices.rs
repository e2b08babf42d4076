//! Device-scoped triggers: backups, changes, upgrades and locks.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use fleetguard_core::{
    ChangeRequest, Device, DeviceLock, FleetBackupEntry, Job, ReadinessReport, Snapshot,
    UpgradePlan,
};

use super::error::{bad_request, dispatch_error, ApiResult};
use crate::state::AppState;

const MAX_LIMIT: i64 = 500;
const DEFAULT_LIMIT: i64 = 50;

/// Who asked; recorded on the job and in the audit log.
#[derive(Debug, Default, Deserialize)]
pub struct RequestedBy {
    pub requested_by: Option<String>,
}

impl RequestedBy {
    fn user(self) -> String {
        self.requested_by
            .unwrap_or_else(|| "anonymous".to_string())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct FleetBackupBody {
    /// Only devices in this region; every enabled device when absent.
    pub region: Option<String>,
    pub requested_by: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FleetBackupResponse {
    pub entries: Vec<FleetBackupEntry>,
    pub queued: usize,
}

#[derive(Debug, Deserialize)]
pub struct ChangeBody {
    pub commands: Vec<String>,
    #[serde(default)]
    pub description: String,
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub auto_confirm: bool,
    pub requested_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpgradeBody {
    pub target_version: String,
    pub requested_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotListParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ReleasedLockResponse {
    pub device_id: String,
    pub released: Option<DeviceLock>,
}

pub async fn list_devices(State(state): State<Arc<AppState>>) -> Json<Vec<Device>> {
    Json(state.dispatcher().devices().list())
}

/// Queue a manual backup of one device
pub async fn trigger_backup(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    body: Option<Json<RequestedBy>>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    let user = body.map(|Json(b)| b).unwrap_or_default().user();
    let job = state
        .dispatcher()
        .trigger_backup(&device_id, &user)
        .await
        .map_err(dispatch_error)?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// Queue backups for the whole fleet or one region
pub async fn backup_fleet(
    State(state): State<Arc<AppState>>,
    body: Option<Json<FleetBackupBody>>,
) -> Json<FleetBackupResponse> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let user = body
        .requested_by
        .unwrap_or_else(|| "anonymous".to_string());
    let dispatcher = state.dispatcher();
    let entries = match body.region {
        Some(region) => dispatcher.backup_region(&region, &user).await,
        None => dispatcher.backup_all(&user).await,
    };
    let queued = entries.iter().filter(|e| e.job_id.is_some()).count();
    Json(FleetBackupResponse { entries, queued })
}

/// Apply commands under commit-confirm
pub async fn apply_change(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    Json(body): Json<ChangeBody>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    if body.commands.iter().any(|c| c.trim().is_empty()) {
        return Err(bad_request("commands cannot contain empty lines"));
    }
    let mut request = ChangeRequest::new(body.commands, body.description);
    if let Some(secs) = body.timeout_secs {
        request = request.with_timeout_secs(secs);
    }
    if body.auto_confirm {
        request = request.with_auto_confirm();
    }
    let user = body
        .requested_by
        .unwrap_or_else(|| "anonymous".to_string());

    let job = state
        .dispatcher()
        .trigger_apply_change(&device_id, request, &user)
        .await
        .map_err(dispatch_error)?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

pub async fn upgrade_readiness(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    Json(body): Json<UpgradeBody>,
) -> ApiResult<Json<ReadinessReport>> {
    state
        .dispatcher()
        .check_upgrade_readiness(&device_id, &body.target_version)
        .await
        .map(Json)
        .map_err(dispatch_error)
}

pub async fn upgrade_plan(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    Json(body): Json<UpgradeBody>,
) -> ApiResult<Json<UpgradePlan>> {
    state
        .dispatcher()
        .generate_upgrade_plan(&device_id, &body.target_version)
        .await
        .map(Json)
        .map_err(dispatch_error)
}

/// Start an upgrade; needs a fresh readiness check that found the device ready
pub async fn initiate_upgrade(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    Json(body): Json<UpgradeBody>,
) -> ApiResult<(StatusCode, Json<Job>)> {
    let user = body
        .requested_by
        .unwrap_or_else(|| "anonymous".to_string());
    let job = state
        .dispatcher()
        .initiate_upgrade(&device_id, &body.target_version, &user)
        .await
        .map_err(dispatch_error)?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// Release a lock left behind by a terminated job
pub async fn release_lock(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    body: Option<Json<RequestedBy>>,
) -> ApiResult<Json<ReleasedLockResponse>> {
    let user = body.map(|Json(b)| b).unwrap_or_default().user();
    let released = state
        .dispatcher()
        .release_lock(&device_id, &user)
        .await
        .map_err(dispatch_error)?;
    Ok(Json(ReleasedLockResponse {
        device_id,
        released,
    }))
}

/// Snapshot history of a device, most recent first
pub async fn list_snapshots(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    Query(params): Query<SnapshotListParams>,
) -> ApiResult<Json<Vec<Snapshot>>> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = params.offset.unwrap_or(0).max(0);
    state
        .dispatcher()
        .list_snapshots(&device_id, limit, offset)
        .map(Json)
        .map_err(dispatch_error)
}
