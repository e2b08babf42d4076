//! Job API handlers.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use fleetguard_core::{Job, JobFilter, JobKind, JobStats, JobStatus};

use super::error::{bad_request, dispatch_error, ApiResult};
use crate::state::AppState;

/// Maximum allowed limit for job queries
const MAX_LIMIT: i64 = 1000;

/// Default limit for job queries
const DEFAULT_LIMIT: i64 = 100;

/// Query parameters for listing jobs
#[derive(Debug, Deserialize)]
pub struct ListJobsParams {
    pub status: Option<String>,
    pub kind: Option<String>,
    pub device_id: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ListJobsResponse {
    pub jobs: Vec<Job>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Request body for cancelling a job
#[derive(Debug, Default, Deserialize)]
pub struct CancelJobBody {
    pub cancelled_by: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ConfirmResponse {
    pub job_id: String,
    pub confirmed: bool,
}

/// List jobs, newest first
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListJobsParams>,
) -> ApiResult<Json<ListJobsResponse>> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = params.offset.unwrap_or(0).max(0);

    let mut filter = JobFilter::new();
    if let Some(ref status) = params.status {
        let status = JobStatus::parse(status)
            .ok_or_else(|| bad_request(format!("Unknown job status: {}", status)))?;
        filter = filter.with_status(status);
    }
    if let Some(ref kind) = params.kind {
        let kind = JobKind::parse(kind)
            .ok_or_else(|| bad_request(format!("Unknown job kind: {}", kind)))?;
        filter = filter.with_kind(kind);
    }
    if let Some(ref device_id) = params.device_id {
        filter = filter.with_device(device_id);
    }

    let dispatcher = state.dispatcher();
    let total = dispatcher.count_jobs(&filter).map_err(dispatch_error)?;
    let jobs = dispatcher
        .list_jobs(&filter.with_limit(limit).with_offset(offset))
        .map_err(dispatch_error)?;

    Ok(Json(ListJobsResponse {
        jobs,
        total,
        limit,
        offset,
    }))
}

pub async fn get_stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<JobStats>> {
    state
        .dispatcher()
        .job_stats()
        .map(Json)
        .map_err(dispatch_error)
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Job>> {
    state
        .dispatcher()
        .get_job(&id)
        .map(Json)
        .map_err(dispatch_error)
}

/// Confirm the open commit-confirm window of an apply-change job
pub async fn confirm_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ConfirmResponse>> {
    state.dispatcher().confirm(&id).map_err(dispatch_error)?;
    Ok(Json(ConfirmResponse {
        job_id: id,
        confirmed: true,
    }))
}

/// Cancel a job that has not started yet
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<CancelJobBody>>,
) -> ApiResult<Json<Job>> {
    let cancelled_by = body
        .and_then(|Json(b)| b.cancelled_by)
        .unwrap_or_else(|| "anonymous".to_string());
    state
        .dispatcher()
        .cancel(&id, &cancelled_by)
        .await
        .map(Json)
        .map_err(dispatch_error)
}
