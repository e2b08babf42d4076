use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::{audit, devices, handlers, jobs, middleware::metrics_middleware, snapshots};
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        // Health, config and status
        .route("/health", get(handlers::health))
        .route("/config", get(handlers::get_config))
        .route("/status", get(handlers::get_status))
        // Audit
        .route("/audit", get(audit::query_audit))
        // Jobs
        .route("/jobs", get(jobs::list_jobs))
        .route("/jobs/stats", get(jobs::get_stats))
        .route("/jobs/{id}", get(jobs::get_job))
        .route("/jobs/{id}/confirm", post(jobs::confirm_job))
        .route("/jobs/{id}/cancel", post(jobs::cancel_job))
        // Devices
        .route("/devices", get(devices::list_devices))
        .route("/devices/backup", post(devices::backup_fleet))
        .route("/devices/{id}/backup", post(devices::trigger_backup))
        .route("/devices/{id}/changes", post(devices::apply_change))
        .route("/devices/{id}/upgrade-readiness", post(devices::upgrade_readiness))
        .route("/devices/{id}/upgrade-plan", post(devices::upgrade_plan))
        .route("/devices/{id}/upgrade", post(devices::initiate_upgrade))
        .route("/devices/{id}/lock", delete(devices::release_lock))
        .route("/devices/{id}/snapshots", get(devices::list_snapshots))
        // Snapshots
        .route("/snapshots/diff", get(snapshots::diff_snapshots))
        .route("/snapshots/{id}", get(snapshots::get_snapshot))
        .route("/snapshots/{id}/content", get(snapshots::get_snapshot_content))
        // Firmware catalog
        .route("/firmware", get(snapshots::list_firmware))
        // Prometheus
        .route("/metrics", get(handlers::get_metrics))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
}
