//! Prometheus metrics for observability.
//!
//! This module provides metrics for monitoring the fleetguard server:
//! - HTTP request metrics (latency, counts, in flight)
//! - Job counts by status and dispatcher capacity (collected dynamically)
//! - Core engine metrics registered from `fleetguard_core::metrics`

use once_cell::sync::Lazy;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use regex_lite::Regex;

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// =============================================================================
// HTTP Request Metrics
// =============================================================================

/// HTTP request duration in seconds.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "fleetguard_http_request_duration_seconds",
            "HTTP request duration in seconds",
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
        ]),
        &["method", "path", "status"],
    )
    .unwrap()
});

pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("fleetguard_http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"],
    )
    .unwrap()
});

pub static HTTP_REQUESTS_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "fleetguard_http_requests_in_flight",
        "Number of HTTP requests currently being processed",
    )
    .unwrap()
});

// =============================================================================
// Ledger and dispatcher (collected dynamically)
// =============================================================================

/// Jobs by current status.
pub static JOBS_BY_STATUS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("fleetguard_jobs_by_status", "Current job count by status"),
        &["status"],
    )
    .unwrap()
});

pub static WORKERS_IDLE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("fleetguard_workers_idle", "Dispatcher worker slots not in use").unwrap()
});

pub static CONFIRM_WINDOWS_OPEN: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "fleetguard_confirm_windows_open",
        "Commit-confirm windows waiting for confirmation",
    )
    .unwrap()
});

// =============================================================================
// Registration
// =============================================================================

fn register_metrics(registry: &Registry) {
    // HTTP
    registry
        .register(Box::new(HTTP_REQUEST_DURATION.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_IN_FLIGHT.clone()))
        .unwrap();

    // Ledger and dispatcher
    registry
        .register(Box::new(JOBS_BY_STATUS.clone()))
        .unwrap();
    registry.register(Box::new(WORKERS_IDLE.clone())).unwrap();
    registry
        .register(Box::new(CONFIRM_WINDOWS_OPEN.clone()))
        .unwrap();

    // Core metrics (dispatcher, snapshots, commit-confirm, upgrades)
    for metric in fleetguard_core::metrics::all_metrics() {
        registry.register(metric).unwrap();
    }
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Refresh gauges from the current ledger and dispatcher state.
pub fn collect_dynamic_metrics(state: &crate::state::AppState) {
    let dispatcher = state.dispatcher();
    let status = dispatcher.status();
    WORKERS_IDLE.set(status.idle_workers as i64);
    CONFIRM_WINDOWS_OPEN.set(status.open_confirm_windows.len() as i64);

    if let Ok(stats) = dispatcher.job_stats() {
        for (label, count) in [
            ("pending", stats.pending),
            ("running", stats.running),
            ("success", stats.success),
            ("failed", stats.failed),
            ("cancelled", stats.cancelled),
        ] {
            JOBS_BY_STATUS.with_label_values(&[label]).set(count);
        }
    }
}

static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
        .unwrap()
});

static DEVICE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"/devices/[^/]+/").unwrap());

/// Normalize a path for metric labels (replace ids with placeholders).
pub fn normalize_path(path: &str) -> String {
    let result = UUID_RE.replace_all(path, "{id}");
    DEVICE_RE.replace_all(&result, "/devices/{id}/").into_owned()
}
