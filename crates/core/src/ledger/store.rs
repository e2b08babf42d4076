//! Job ledger trait and request/filter types.

use thiserror::Error;

use super::types::{DeviceLock, Job, JobKind, JobOutcome, JobStats, JobStatus};

/// Error type for ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Job not found: {0}")]
    NotFound(String),

    /// The device already has a job in flight. Creation is rejected, never queued.
    #[error("Device {device_id} is locked by job {holder}")]
    DeviceLocked { device_id: String, holder: String },

    #[error("Cannot move job {job_id} from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    /// Operator release refused because the holder has not terminated.
    #[error("Lock on device {device_id} is held by active job {job_id}")]
    LockHeld { device_id: String, job_id: String },

    #[error("Database error: {0}")]
    Database(String),
}

/// Request to create a new job.
#[derive(Debug, Clone)]
pub struct CreateJobRequest {
    pub device_id: String,
    pub kind: JobKind,
    pub requested_by: String,
    pub params: serde_json::Value,
}

impl CreateJobRequest {
    pub fn new(device_id: impl Into<String>, kind: JobKind) -> Self {
        Self {
            device_id: device_id.into(),
            kind,
            requested_by: "system".to_string(),
            params: serde_json::json!({}),
        }
    }

    pub fn requested_by(mut self, user: impl Into<String>) -> Self {
        self.requested_by = user.into();
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

/// Filter for querying jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub kind: Option<JobKind>,
    pub device_id: Option<String>,
    /// Maximum number of results.
    pub limit: i64,
    /// Offset for pagination.
    pub offset: i64,
}

impl JobFilter {
    pub fn new() -> Self {
        Self {
            status: None,
            kind: None,
            device_id: None,
            limit: 100,
            offset: 0,
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_kind(mut self, kind: JobKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }
}

/// Durable job records plus the per-device lock registry.
///
/// The lock is acquired atomically with job creation and released exactly
/// once, by the terminal transition of the job that holds it.
pub trait JobLedger: Send + Sync {
    /// Create a pending job, taking the device lock in the same step.
    /// Fails with [`LedgerError::DeviceLocked`] if the device is busy.
    fn create(&self, request: CreateJobRequest) -> Result<Job, LedgerError>;

    fn get(&self, id: &str) -> Result<Option<Job>, LedgerError>;

    /// List jobs matching the filter, newest first.
    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, LedgerError>;

    /// Count jobs matching the filter (limit/offset ignored).
    fn count(&self, filter: &JobFilter) -> Result<i64, LedgerError>;

    fn stats(&self) -> Result<JobStats, LedgerError>;

    /// Move a job to a status that carries no outcome payload
    /// (`pending -> running`, `pending -> cancelled`).
    fn transition(&self, id: &str, status: JobStatus) -> Result<Job, LedgerError>;

    /// Finish a running job with its outcome and release the device lock.
    fn complete(&self, id: &str, outcome: JobOutcome) -> Result<Job, LedgerError>;

    /// Fail any non-terminal job as interrupted, flag it for attention and
    /// release its lock. Used by scoped cleanup and restart recovery.
    fn abort(&self, id: &str, reason: &str) -> Result<Job, LedgerError>;

    /// Replace the result payload of a non-terminal job.
    fn update_result(&self, id: &str, result: serde_json::Value) -> Result<(), LedgerError>;

    fn lock_holder(&self, device_id: &str) -> Result<Option<DeviceLock>, LedgerError>;

    /// Operator release of a stale lock. Refused while the holder is active.
    /// Returns the released lock, or `None` if the device was not locked.
    fn release_lock(&self, device_id: &str) -> Result<Option<DeviceLock>, LedgerError>;

    /// Fail every job a previous process left pending or running.
    fn recover(&self) -> Result<Vec<Job>, LedgerError>;

    fn start(&self, id: &str) -> Result<Job, LedgerError> {
        self.transition(id, JobStatus::Running)
    }

    fn cancel(&self, id: &str) -> Result<Job, LedgerError> {
        self.transition(id, JobStatus::Cancelled)
    }
}
