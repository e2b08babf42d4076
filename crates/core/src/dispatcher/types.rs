//! Types for the task dispatcher.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::change::ChangeError;
use crate::ledger::{JobStatus, LedgerError};
use crate::snapshot::SnapshotError;
use crate::upgrade::UpgradeError;

/// Errors returned to callers of the dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device {0} is disabled")]
    DeviceDisabled(String),

    /// Another job holds the device. Rejected immediately, never queued.
    #[error("Device {device_id} is locked by job {holder}")]
    DeviceLocked { device_id: String, holder: String },

    /// The same request was just handled by `job_id`.
    #[error("Duplicate request: job {job_id} just ran with the same parameters")]
    Duplicate { job_id: String },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {job_id} is {status}; only pending jobs can be cancelled")]
    NotPending { job_id: String, status: JobStatus },

    #[error("Job {0} is not awaiting confirmation")]
    NotAwaitingConfirmation(String),

    /// No cached, ready readiness report for this device and target.
    #[error("Device {device_id} is not ready for upgrade: {reason}")]
    UpgradeNotReady { device_id: String, reason: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("change error: {0}")]
    Change(#[from] ChangeError),

    #[error("upgrade error: {0}")]
    Upgrade(#[from] UpgradeError),
}

impl DispatchError {
    /// Label used for rejection metrics and audit events.
    pub fn reason(&self) -> &'static str {
        match self {
            DispatchError::DeviceNotFound(_) => "not_found",
            DispatchError::DeviceDisabled(_) => "disabled",
            DispatchError::DeviceLocked { .. } => "locked",
            DispatchError::Duplicate { .. } => "duplicate",
            DispatchError::UpgradeNotReady { .. } => "not_ready",
            DispatchError::InvalidRequest(_) | DispatchError::Change(_) => "invalid",
            _ => "error",
        }
    }
}

/// Result of one device in a fleet-wide backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetBackupEntry {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Why no job was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected: Option<String>,
}

/// Current status of the dispatcher.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatcherStatus {
    pub running: bool,
    pub max_workers: usize,
    /// Worker slots not in use.
    pub idle_workers: usize,
    /// Jobs whose confirm window is open right now.
    pub open_confirm_windows: Vec<String>,
}
