use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Audit event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    // System events
    ServiceStarted {
        version: String,
        config_hash: String,
    },
    ServiceStopped {
        reason: String,
    },
    /// Jobs a previous process left unfinished were failed on startup.
    JobsRecovered {
        job_ids: Vec<String>,
    },

    // Job lifecycle
    JobCreated {
        job_id: String,
        device_id: String,
        kind: String,
        requested_by: String,
    },
    /// A trigger was refused before any job existed.
    TriggerRejected {
        device_id: String,
        kind: String,
        reason: String,
    },
    JobStateChanged {
        job_id: String,
        device_id: String,
        from_state: String,
        to_state: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default)]
        needs_attention: bool,
    },
    JobCancelled {
        job_id: String,
        device_id: String,
        cancelled_by: String,
    },
    LockReleased {
        device_id: String,
        job_id: String,
        released_by: String,
    },

    // Snapshots
    SnapshotTaken {
        snapshot_id: String,
        device_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
        trigger: String,
        commit_ref: String,
        size_bytes: u64,
    },

    // Commit-confirm
    ChangeCommitted {
        job_id: String,
        device_id: String,
        commit_id: String,
        confirm_timeout_secs: u64,
        command_count: usize,
    },
    ChangeConfirmed {
        job_id: String,
        device_id: String,
        /// "operator" or "auto"
        source: String,
    },
    ChangeRolledBack {
        job_id: String,
        device_id: String,
        /// Set when the reverted config does not match the pre-change snapshot.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        discrepancy: Option<String>,
    },
    ReachabilityLost {
        job_id: String,
        device_id: String,
        context: String,
    },
    ReconciliationFailed {
        job_id: String,
        device_id: String,
        waited_secs: u64,
    },

    // Firmware upgrade
    UpgradeReadinessChecked {
        device_id: String,
        target_version: String,
        ready: bool,
        risk: String,
    },
    UpgradePhaseCompleted {
        job_id: String,
        device_id: String,
        phase: String,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl AuditEvent {
    /// Returns the event type as a string for storage
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ServiceStarted { .. } => "service_started",
            Self::ServiceStopped { .. } => "service_stopped",
            Self::JobsRecovered { .. } => "jobs_recovered",
            Self::JobCreated { .. } => "job_created",
            Self::TriggerRejected { .. } => "trigger_rejected",
            Self::JobStateChanged { .. } => "job_state_changed",
            Self::JobCancelled { .. } => "job_cancelled",
            Self::LockReleased { .. } => "lock_released",
            Self::SnapshotTaken { .. } => "snapshot_taken",
            Self::ChangeCommitted { .. } => "change_committed",
            Self::ChangeConfirmed { .. } => "change_confirmed",
            Self::ChangeRolledBack { .. } => "change_rolled_back",
            Self::ReachabilityLost { .. } => "reachability_lost",
            Self::ReconciliationFailed { .. } => "reconciliation_failed",
            Self::UpgradeReadinessChecked { .. } => "upgrade_readiness_checked",
            Self::UpgradePhaseCompleted { .. } => "upgrade_phase_completed",
        }
    }

    /// Extract job_id if this event is job-related
    pub fn job_id(&self) -> Option<&str> {
        match self {
            Self::JobCreated { job_id, .. }
            | Self::JobStateChanged { job_id, .. }
            | Self::JobCancelled { job_id, .. }
            | Self::LockReleased { job_id, .. }
            | Self::ChangeCommitted { job_id, .. }
            | Self::ChangeConfirmed { job_id, .. }
            | Self::ChangeRolledBack { job_id, .. }
            | Self::ReachabilityLost { job_id, .. }
            | Self::ReconciliationFailed { job_id, .. }
            | Self::UpgradePhaseCompleted { job_id, .. } => Some(job_id),
            Self::SnapshotTaken { job_id, .. } => job_id.as_deref(),
            Self::ServiceStarted { .. }
            | Self::ServiceStopped { .. }
            | Self::JobsRecovered { .. }
            | Self::TriggerRejected { .. }
            | Self::UpgradeReadinessChecked { .. } => None,
        }
    }

    /// Extract device_id if this event concerns a single device
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Self::JobCreated { device_id, .. }
            | Self::TriggerRejected { device_id, .. }
            | Self::JobStateChanged { device_id, .. }
            | Self::JobCancelled { device_id, .. }
            | Self::LockReleased { device_id, .. }
            | Self::SnapshotTaken { device_id, .. }
            | Self::ChangeCommitted { device_id, .. }
            | Self::ChangeConfirmed { device_id, .. }
            | Self::ChangeRolledBack { device_id, .. }
            | Self::ReachabilityLost { device_id, .. }
            | Self::ReconciliationFailed { device_id, .. }
            | Self::UpgradeReadinessChecked { device_id, .. }
            | Self::UpgradePhaseCompleted { device_id, .. } => Some(device_id),
            Self::ServiceStarted { .. } | Self::ServiceStopped { .. } | Self::JobsRecovered { .. } => {
                None
            }
        }
    }
}

/// A stored audit record with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub job_id: Option<String>,
    pub device_id: Option<String>,
    pub data: AuditEvent,
}
