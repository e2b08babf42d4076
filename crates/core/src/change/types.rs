//! Change requests, reports, and errors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ChangeError {
    #[error("Confirm timeout {requested}s is outside the allowed range {min}..={max}s")]
    TimeoutOutOfRange { requested: u64, min: u64, max: u64 },

    #[error("Job {0} is not awaiting confirmation")]
    NotAwaitingConfirmation(String),
}

/// A set of device commands to apply under commit-confirm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub commands: Vec<String>,
    #[serde(default)]
    pub description: String,
    /// Confirm window in seconds; the configured default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Confirm automatically once the device answers after the commit.
    #[serde(default)]
    pub auto_confirm: bool,
}

impl ChangeRequest {
    pub fn new(commands: Vec<String>, description: impl Into<String>) -> Self {
        Self {
            commands,
            description: description.into(),
            timeout_secs: None,
            auto_confirm: false,
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_auto_confirm(mut self) -> Self {
        self.auto_confirm = true;
        self
    }
}

/// Who closed a confirm window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationSource {
    Operator,
    Auto,
}

impl ConfirmationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Operator => "operator",
            Self::Auto => "auto",
        }
    }
}

/// Commit-confirm states, in the order a successful change visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangePhase {
    Validating,
    PreSnapshot,
    Staged,
    ConfirmWindow,
    Confirmed,
    ReachabilityLost,
    Reconciling,
    RolledBack,
    PostSnapshot,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: ChangePhase,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Result payload stored on an apply-change job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeReport {
    pub description: String,
    pub commands: Vec<String>,
    pub timeout_secs: u64,
    pub auto_confirm: bool,
    pub phases: Vec<PhaseRecord>,
    pub commit_id: Option<String>,
    pub pre_snapshot_id: Option<String>,
    pub post_snapshot_id: Option<String>,
    pub confirmed: bool,
    /// `None` when nobody confirmed.
    pub confirmed_by: Option<ConfirmationSource>,
    pub diff: Option<String>,
    /// Set when a reverted device does not match its pre-change snapshot.
    pub discrepancy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl ChangeReport {
    pub fn new(request: &ChangeRequest, timeout_secs: u64) -> Self {
        Self {
            description: request.description.clone(),
            commands: request.commands.clone(),
            timeout_secs,
            auto_confirm: request.auto_confirm,
            ..Default::default()
        }
    }

    pub fn record(&mut self, phase: ChangePhase, detail: Option<String>) {
        self.phases.push(PhaseRecord {
            phase,
            at: Utc::now(),
            detail,
        });
    }

    pub fn last_phase(&self) -> Option<ChangePhase> {
        self.phases.last().map(|p| p.phase)
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}
