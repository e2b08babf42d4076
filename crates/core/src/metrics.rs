//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Dispatcher (jobs created, finished, rejected, in flight)
//! - Snapshots
//! - Commit-confirm windows and device reachability polling
//! - Firmware upgrade phases

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts};

// =============================================================================
// Dispatcher - Job Metrics
// =============================================================================

/// Jobs created by kind.
pub static JOBS_CREATED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("fleetguard_jobs_created_total", "Total jobs created"),
        &["kind"], // "backup", "apply_change", "upgrade"
    )
    .unwrap()
});

/// Jobs reaching a terminal state.
pub static JOBS_FINISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("fleetguard_jobs_finished_total", "Total jobs finished"),
        &["kind", "status", "failure"],
    )
    .unwrap()
});

/// Wall time from job start to terminal state.
pub static JOB_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "fleetguard_job_duration_seconds",
            "Duration of jobs from start to finish",
        )
        .buckets(vec![1.0, 5.0, 15.0, 60.0, 300.0, 600.0, 1200.0, 3600.0]),
        &["kind"],
    )
    .unwrap()
});

/// Jobs holding a worker permit right now.
pub static JOBS_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("fleetguard_jobs_running", "Jobs currently running").unwrap()
});

/// Trigger requests refused before a job was created.
pub static TRIGGER_REJECTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "fleetguard_trigger_rejections_total",
            "Trigger requests rejected by the dispatcher",
        ),
        &["reason"], // "locked", "duplicate", "not_ready", "disabled", "not_found"
    )
    .unwrap()
});

// =============================================================================
// Snapshots
// =============================================================================

pub static SNAPSHOTS_TAKEN: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("fleetguard_snapshots_taken_total", "Total snapshots taken"),
        &["trigger"],
    )
    .unwrap()
});

// =============================================================================
// Commit-confirm and reachability
// =============================================================================

/// Confirm windows by how they closed.
pub static CONFIRM_WINDOWS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "fleetguard_confirm_windows_total",
            "Commit-confirm windows by outcome",
        ),
        &["outcome"], // "confirmed", "expired", "unreachable", "rejected"
    )
    .unwrap()
});

pub static REACHABILITY_POLLS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "fleetguard_reachability_polls_total",
        "Reachability probes sent while waiting for a device",
    )
    .unwrap()
});

// =============================================================================
// Firmware upgrades
// =============================================================================

pub static UPGRADE_PHASES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "fleetguard_upgrade_phases_total",
            "Upgrade phases by phase and final status",
        ),
        &["phase", "status"],
    )
    .unwrap()
});

// =============================================================================
// Helper functions
// =============================================================================

/// Get all core metrics for registration in a registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Jobs
        Box::new(JOBS_CREATED.clone()),
        Box::new(JOBS_FINISHED.clone()),
        Box::new(JOB_DURATION.clone()),
        Box::new(JOBS_RUNNING.clone()),
        Box::new(TRIGGER_REJECTIONS.clone()),
        // Snapshots
        Box::new(SNAPSHOTS_TAKEN.clone()),
        // Commit-confirm
        Box::new(CONFIRM_WINDOWS.clone()),
        Box::new(REACHABILITY_POLLS.clone()),
        // Upgrades
        Box::new(UPGRADE_PHASES.clone()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Registry;

    #[test]
    fn test_all_metrics_register() {
        let registry = Registry::new();
        for metric in all_metrics() {
            registry.register(metric).unwrap();
        }
        JOBS_CREATED.with_label_values(&["backup"]).inc();
        let names: Vec<String> = registry
            .gather()
            .into_iter()
            .map(|f| f.get_name().to_string())
            .collect();
        assert!(names.contains(&"fleetguard_jobs_created_total".to_string()));
    }
}
