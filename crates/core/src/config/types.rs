use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::change::CommitConfirmConfig;
use crate::device::Device;
use crate::dispatcher::DispatcherConfig;
use crate::upgrade::UpgradeConfig;

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub transport: TransportConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub snapshots: SnapshotConfig,
    #[serde(default)]
    pub commit_confirm: CommitConfirmConfig,
    #[serde(default)]
    pub upgrade: UpgradeConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub devices: Vec<Device>,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    8080
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("fleetguard.db")
}

/// Snapshot content repository configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SnapshotConfig {
    /// Root directory of the append-only content repository.
    #[serde(default = "default_repository_path")]
    pub repository_path: PathBuf,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            repository_path: default_repository_path(),
        }
    }
}

fn default_repository_path() -> PathBuf {
    PathBuf::from("snapshots")
}

/// Device gateway configuration for the HTTP transport.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Base URL of the device-management gateway, e.g. "http://gateway:9400".
    pub gateway_url: String,
    /// Bearer token sent to the gateway.
    #[serde(default)]
    pub api_token: Option<String>,
    /// Timeout for ordinary gateway requests.
    #[serde(default = "default_transport_timeout")]
    pub timeout_secs: u32,
    /// Timeout for firmware image uploads.
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_secs: u32,
}

fn default_transport_timeout() -> u32 {
    60
}

fn default_transfer_timeout() -> u32 {
    3600
}

/// Sanitized config for API responses (secrets redacted)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub snapshots: SnapshotConfig,
    pub commit_confirm: CommitConfirmConfig,
    pub upgrade: UpgradeConfig,
    pub dispatcher: DispatcherConfig,
    pub transport: SanitizedTransportConfig,
    pub devices: Vec<Device>,
}

/// Sanitized transport config (token hidden)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedTransportConfig {
    pub gateway_url: String,
    pub api_token_configured: bool,
    pub timeout_secs: u32,
    pub transfer_timeout_secs: u32,
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        Self {
            server: config.server.clone(),
            database: config.database.clone(),
            snapshots: config.snapshots.clone(),
            commit_confirm: config.commit_confirm.clone(),
            upgrade: config.upgrade.clone(),
            dispatcher: config.dispatcher.clone(),
            transport: SanitizedTransportConfig {
                gateway_url: config.transport.gateway_url.clone(),
                api_token_configured: config
                    .transport
                    .api_token
                    .as_ref()
                    .is_some_and(|t| !t.is_empty()),
                timeout_secs: config.transport.timeout_secs,
                transfer_timeout_secs: config.transport.transfer_timeout_secs,
            },
            devices: config.devices.clone(),
        }
    }
}
