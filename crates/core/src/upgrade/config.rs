//! Upgrade configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::Backoff;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeConfig {
    /// Root of the firmware catalog (`<major>.x/*.tgz` below it).
    #[serde(default = "default_firmware_dir")]
    pub firmware_dir: PathBuf,

    /// Free space required on the device, as a multiple of the image size.
    #[serde(default = "default_headroom")]
    pub storage_headroom_factor: f64,

    /// Configurations larger than this raise upgrade risk.
    #[serde(default = "default_large_config")]
    pub large_config_bytes: u64,

    /// How long a readiness report stays valid for initiating an upgrade.
    #[serde(default = "default_readiness_ttl")]
    pub readiness_ttl_secs: u64,

    /// Planning estimate for image transfer throughput.
    #[serde(default = "default_transfer_rate")]
    pub transfer_rate_bytes_per_sec: u64,

    /// Planning estimate for package installation.
    #[serde(default = "default_install_estimate")]
    pub install_estimate_secs: u64,

    #[serde(default)]
    pub reachability: ReachabilityWait,
}

/// Waiting for a device to come back from its reboot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReachabilityWait {
    /// Delay before the first probe after requesting the reboot.
    #[serde(default = "default_grace")]
    pub reboot_grace_secs: u64,

    #[serde(default = "default_initial_interval")]
    pub initial_interval_secs: u64,

    #[serde(default = "default_max_interval")]
    pub max_interval_secs: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Give up this long after the reboot request.
    #[serde(default = "default_ceiling")]
    pub ceiling_secs: u64,
}

fn default_firmware_dir() -> PathBuf {
    PathBuf::from("firmware")
}

fn default_headroom() -> f64 {
    2.0
}

fn default_large_config() -> u64 {
    512 * 1024
}

fn default_readiness_ttl() -> u64 {
    3600
}

fn default_transfer_rate() -> u64 {
    2 * 1024 * 1024
}

fn default_install_estimate() -> u64 {
    900
}

fn default_grace() -> u64 {
    60
}

fn default_initial_interval() -> u64 {
    15
}

fn default_max_interval() -> u64 {
    120
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_ceiling() -> u64 {
    1200 // 20 minutes
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            firmware_dir: default_firmware_dir(),
            storage_headroom_factor: default_headroom(),
            large_config_bytes: default_large_config(),
            readiness_ttl_secs: default_readiness_ttl(),
            transfer_rate_bytes_per_sec: default_transfer_rate(),
            install_estimate_secs: default_install_estimate(),
            reachability: ReachabilityWait::default(),
        }
    }
}

impl Default for ReachabilityWait {
    fn default() -> Self {
        Self {
            reboot_grace_secs: default_grace(),
            initial_interval_secs: default_initial_interval(),
            max_interval_secs: default_max_interval(),
            backoff_multiplier: default_backoff_multiplier(),
            ceiling_secs: default_ceiling(),
        }
    }
}

impl ReachabilityWait {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_secs(self.initial_interval_secs),
            Duration::from_secs(self.max_interval_secs),
            self.backoff_multiplier,
        )
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.reboot_grace_secs)
    }

    pub fn ceiling(&self) -> Duration {
        Duration::from_secs(self.ceiling_secs)
    }
}

impl UpgradeConfig {
    /// Bytes that must be free on the device for an image of `image_bytes`.
    pub fn required_free_bytes(&self, image_bytes: u64) -> u64 {
        (image_bytes as f64 * self.storage_headroom_factor).ceil() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = UpgradeConfig::default();
        assert_eq!(config.firmware_dir, PathBuf::from("firmware"));
        assert_eq!(config.reachability.ceiling(), Duration::from_secs(1200));
        assert_eq!(config.required_free_bytes(100), 200);
    }

    #[test]
    fn test_deserialize_nested() {
        let toml = r#"
            firmware_dir = "/srv/firmware"
            storage_headroom_factor = 1.5
            [reachability]
            ceiling_secs = 600
        "#;
        let config: UpgradeConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.required_free_bytes(100), 150);
        assert_eq!(config.reachability.ceiling_secs, 600);
        assert_eq!(config.reachability.reboot_grace_secs, 60);
    }
}
