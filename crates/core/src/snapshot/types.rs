//! Snapshot types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::device::Device;

/// Why a snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotTrigger {
    Manual,
    Scheduled,
    PreChange,
    PostChange,
    PreUpgrade,
    PostUpgrade,
}

impl SnapshotTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotTrigger::Manual => "manual",
            SnapshotTrigger::Scheduled => "scheduled",
            SnapshotTrigger::PreChange => "pre_change",
            SnapshotTrigger::PostChange => "post_change",
            SnapshotTrigger::PreUpgrade => "pre_upgrade",
            SnapshotTrigger::PostUpgrade => "post_upgrade",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(SnapshotTrigger::Manual),
            "scheduled" => Some(SnapshotTrigger::Scheduled),
            "pre_change" => Some(SnapshotTrigger::PreChange),
            "post_change" => Some(SnapshotTrigger::PostChange),
            "pre_upgrade" => Some(SnapshotTrigger::PreUpgrade),
            "post_upgrade" => Some(SnapshotTrigger::PostUpgrade),
            _ => None,
        }
    }
}

impl std::fmt::Display for SnapshotTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable capture of a device's configuration text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub device_id: String,
    /// Repository commit holding the content.
    pub commit_ref: String,
    /// SHA-256 of the content.
    pub content_hash: String,
    pub trigger: SnapshotTrigger,
    pub taken_at: DateTime<Utc>,
    pub size_bytes: u64,
    /// Storage path of the device's history, relative to the repository root.
    pub path: String,
    pub message: String,
    pub job_id: Option<String>,
}

/// Everything needed to record one snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotRequest {
    pub device_id: String,
    /// Hierarchical storage key: region, site, hostname.
    pub location: [String; 3],
    pub content: String,
    pub trigger: SnapshotTrigger,
    pub message: Option<String>,
    pub job_id: Option<String>,
}

impl SnapshotRequest {
    pub fn for_device(device: &Device, content: impl Into<String>, trigger: SnapshotTrigger) -> Self {
        Self {
            device_id: device.id.clone(),
            location: [
                device.region.clone().unwrap_or_default(),
                device.site.clone().unwrap_or_default(),
                device.hostname.clone(),
            ],
            content: content.into(),
            trigger,
            message: None,
            job_id: None,
        }
    }

    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Commit message recorded in the repository.
    pub fn commit_message(&self) -> String {
        self.message.clone().unwrap_or_else(|| {
            format!("{} snapshot of device {}", self.trigger, self.device_id)
        })
    }
}
