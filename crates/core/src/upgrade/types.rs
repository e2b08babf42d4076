use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::TransportError;

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("Firmware {0} is not in the catalog")]
    ImageNotFound(String),

    #[error("Invalid firmware version: {0}")]
    InvalidVersion(String),

    #[error("Firmware catalog error: {0}")]
    Catalog(String),

    #[error("Device {device_id} is unreachable: {reason}")]
    Unreachable { device_id: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// A firmware image in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareImage {
    pub version: String,
    pub file_name: String,
    #[serde(skip)]
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Catalog directory, e.g. `23.x`.
    pub major_dir: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

/// Pre-upgrade assessment of one device against one target version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessReport {
    pub device_id: String,
    pub target_version: String,
    pub current_version: Option<String>,
    pub model: Option<String>,
    pub ready: bool,
    pub risk: RiskLevel,
    /// Things that must happen before the upgrade can start.
    pub prerequisites: Vec<String>,
    pub warnings: Vec<String>,
    pub image: Option<FirmwareImage>,
    pub available_bytes: Option<u64>,
    pub config_bytes: Option<u64>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradePhase {
    PreChecks,
    PreBackup,
    ImageTransfer,
    ChecksumValidation,
    Install,
    Reboot,
    ReachabilityWait,
    PostValidation,
    PostBackup,
}

impl UpgradePhase {
    pub const ALL: [UpgradePhase; 9] = [
        UpgradePhase::PreChecks,
        UpgradePhase::PreBackup,
        UpgradePhase::ImageTransfer,
        UpgradePhase::ChecksumValidation,
        UpgradePhase::Install,
        UpgradePhase::Reboot,
        UpgradePhase::ReachabilityWait,
        UpgradePhase::PostValidation,
        UpgradePhase::PostBackup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UpgradePhase::PreChecks => "pre_checks",
            UpgradePhase::PreBackup => "pre_backup",
            UpgradePhase::ImageTransfer => "image_transfer",
            UpgradePhase::ChecksumValidation => "checksum_validation",
            UpgradePhase::Install => "install",
            UpgradePhase::Reboot => "reboot",
            UpgradePhase::ReachabilityWait => "reachability_wait",
            UpgradePhase::PostValidation => "post_validation",
            UpgradePhase::PostBackup => "post_backup",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub order: usize,
    pub phase: UpgradePhase,
    pub description: String,
    pub estimated_secs: u64,
}

/// Advisory upgrade plan. Generating one changes nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradePlan {
    pub device_id: String,
    pub current_version: Option<String>,
    pub target_version: String,
    pub image: FirmwareImage,
    pub steps: Vec<PlanStep>,
    pub estimated_total_secs: u64,
    pub rollback_procedure: Vec<String>,
    pub risk: RiskLevel,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: UpgradePhase,
    pub status: PhaseStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeOutcome {
    ValidatedSuccess,
    ValidationFailed,
    UnreachableTimeout,
    Aborted,
}

/// Result payload stored on an upgrade job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpgradeReport {
    pub target_version: String,
    pub previous_version: Option<String>,
    pub new_version: Option<String>,
    pub image_file: Option<String>,
    pub expected_checksum: Option<String>,
    pub remote_checksum: Option<String>,
    pub pre_snapshot_id: Option<String>,
    pub post_snapshot_id: Option<String>,
    pub phases: Vec<PhaseResult>,
    pub outcome: Option<UpgradeOutcome>,
}

impl UpgradeReport {
    pub fn new(target_version: impl Into<String>) -> Self {
        Self {
            target_version: target_version.into(),
            ..Default::default()
        }
    }

    pub fn begin(&mut self, phase: UpgradePhase) {
        self.phases.push(PhaseResult {
            phase,
            status: PhaseStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            detail: None,
        });
    }

    /// Close the running phase. Returns the phase that was closed.
    pub fn end(&mut self, status: PhaseStatus, detail: Option<String>) -> Option<UpgradePhase> {
        let current = self
            .phases
            .last_mut()
            .filter(|p| p.status == PhaseStatus::Running)?;
        current.status = status;
        current.finished_at = Some(Utc::now());
        current.detail = detail;
        Some(current.phase)
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Parameters stored on an upgrade job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradeRequest {
    pub target_version: String,
}
