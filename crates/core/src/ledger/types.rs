//! Job ledger types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of orchestration operation a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Backup,
    ApplyChange,
    Upgrade,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Backup => "backup",
            JobKind::ApplyChange => "apply_change",
            JobKind::Upgrade => "upgrade",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "backup" => Some(JobKind::Backup),
            "apply_change" => Some(JobKind::ApplyChange),
            "upgrade" => Some(JobKind::Upgrade),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a job.
///
/// ```text
/// pending ──> running ──> success
///    │           └──────> failed
///    └──> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "success" => Some(JobStatus::Success),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the ledger accepts a transition from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Success)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed reason a job ended in `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The device rejected the candidate commands during the syntax check.
    ValidationError,
    /// The confirm window elapsed and the device reverted the commit.
    RollbackOccurred,
    /// The device could not be reached again before the reconciliation ceiling.
    UnreachableError,
    /// The transferred firmware image does not match the local image.
    ChecksumMismatch,
    /// The device came back on a version other than the target.
    ValidationFailedPostUpgrade,
    /// The device did not come back after reboot.
    UnreachableTimeout,
    /// A transport-level error, carried verbatim in the job error text.
    Transport,
    /// A confirmed change left the running configuration unchanged.
    NoEffectiveChange,
    /// Engine or storage failure unrelated to the device.
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::ValidationError => "validation_error",
            FailureKind::RollbackOccurred => "rollback_occurred",
            FailureKind::UnreachableError => "unreachable_error",
            FailureKind::ChecksumMismatch => "checksum_mismatch",
            FailureKind::ValidationFailedPostUpgrade => "validation_failed_post_upgrade",
            FailureKind::UnreachableTimeout => "unreachable_timeout",
            FailureKind::Transport => "transport",
            FailureKind::NoEffectiveChange => "no_effective_change",
            FailureKind::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "validation_error" => Some(FailureKind::ValidationError),
            "rollback_occurred" => Some(FailureKind::RollbackOccurred),
            "unreachable_error" => Some(FailureKind::UnreachableError),
            "checksum_mismatch" => Some(FailureKind::ChecksumMismatch),
            "validation_failed_post_upgrade" => Some(FailureKind::ValidationFailedPostUpgrade),
            "unreachable_timeout" => Some(FailureKind::UnreachableTimeout),
            "transport" => Some(FailureKind::Transport),
            "no_effective_change" => Some(FailureKind::NoEffectiveChange),
            "internal" => Some(FailureKind::Internal),
            _ => None,
        }
    }

    /// Expected outcomes are not defects: an unconfirmed change reverting is
    /// the safety mechanism working.
    pub fn is_expected(&self) -> bool {
        matches!(self, FailureKind::RollbackOccurred)
    }

    pub fn requires_manual_action(&self) -> bool {
        matches!(
            self,
            FailureKind::UnreachableError
                | FailureKind::ValidationFailedPostUpgrade
                | FailureKind::UnreachableTimeout
                | FailureKind::NoEffectiveChange
        )
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable record of one orchestration operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub device_id: String,
    pub status: JobStatus,
    /// User that triggered the job, or "system" for scheduled work.
    pub requested_by: String,
    /// Trigger parameters as given to the dispatcher.
    pub params: serde_json::Value,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Free-form result payload, updated progressively while running.
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
    /// An operator must reconcile or roll back by hand.
    pub needs_attention: bool,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock run time, once the job has both started and finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

/// How a running job ended, as reported by the engine that ran it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub result: serde_json::Value,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
    pub needs_attention: bool,
}

impl JobOutcome {
    pub fn success(result: serde_json::Value) -> Self {
        Self {
            status: JobStatus::Success,
            result,
            error: None,
            failure: None,
            needs_attention: false,
        }
    }

    pub fn failed(
        failure: FailureKind,
        error: impl Into<String>,
        result: serde_json::Value,
    ) -> Self {
        Self {
            status: JobStatus::Failed,
            result,
            error: Some(error.into()),
            failure: Some(failure),
            needs_attention: failure.requires_manual_action(),
        }
    }

    pub fn with_attention(mut self) -> Self {
        self.needs_attention = true;
        self
    }
}

/// Per-status job counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub total: i64,
    pub pending: i64,
    pub running: i64,
    pub success: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub needs_attention: i64,
}

/// Exclusive claim on a device, held from job creation until termination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceLock {
    pub device_id: String,
    pub job_id: String,
    pub acquired_at: DateTime<Utc>,
}
