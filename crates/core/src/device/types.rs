//! Device and transport session types.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A managed device, as read from the external inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Opaque inventory id.
    pub id: String,
    pub hostname: String,
    /// Management address the transport connects to.
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub site: Option<String>,
    /// Reference to the credentials held by the device gateway. Never the secret itself.
    #[serde(default)]
    pub credential_ref: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_port() -> u16 {
    22
}

fn default_enabled() -> bool {
    true
}

impl Device {
    pub fn new(id: impl Into<String>, hostname: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hostname: hostname.into(),
            address: address.into(),
            port: default_port(),
            region: None,
            site: None,
            credential_ref: None,
            enabled: true,
        }
    }

    pub fn with_location(mut self, region: impl Into<String>, site: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self.site = Some(site.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// An open management session on a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSession {
    pub id: String,
    pub device_id: String,
    pub address: String,
}

/// A provisional commit that the device reverts unless confirmed in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitHandle {
    pub commit_id: String,
    pub session_id: String,
    pub device_id: String,
    pub address: String,
    pub timeout: Duration,
    pub issued_at: DateTime<Utc>,
}

/// Identity facts reported by a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFacts {
    pub model: String,
    pub version: String,
    pub uptime_secs: u64,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub serial: Option<String>,
}

/// Storage on the device's image partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

/// A firmware image to copy onto a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageTransfer {
    pub local_path: PathBuf,
    pub file_name: String,
    pub size_bytes: u64,
}

/// Errors reported by a device transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("device unreachable: {0}")]
    Unreachable(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The device rejected the candidate commands.
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("commit failed: {0}")]
    CommitFailed(String),

    #[error("no pending commit {0} on device")]
    UnknownCommit(String),

    #[error("session {0} is no longer open")]
    SessionClosed(String),

    #[error("transport protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether the device's state is unknown because it could not be reached.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            TransportError::Unreachable(_)
                | TransportError::Timeout(_)
                | TransportError::SessionClosed(_)
        )
    }
}
