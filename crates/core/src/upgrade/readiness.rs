//! Upgrade readiness: a pure assessment plus a per-device cache.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;

use super::config::UpgradeConfig;
use super::types::{FirmwareImage, ReadinessReport, RiskLevel};
use super::version::FirmwareVersion;
use crate::device::{DeviceFacts, StorageInfo};

/// What was learned about a device before assessing it.
#[derive(Debug, Clone)]
pub struct ReadinessInput {
    pub device_id: String,
    pub target_version: String,
    pub reachable: bool,
    pub facts: Option<DeviceFacts>,
    pub storage: Option<StorageInfo>,
    pub config_bytes: Option<u64>,
    pub image: Option<FirmwareImage>,
}

/// Apply the readiness rules. The device is ready only when nothing blocks
/// the upgrade and no prerequisite is outstanding.
pub fn assess(input: &ReadinessInput, config: &UpgradeConfig) -> ReadinessReport {
    let mut risk = RiskLevel::Low;
    let mut blocked = false;
    let mut prerequisites = Vec::new();
    let mut warnings = Vec::new();

    let target = FirmwareVersion::parse(&input.target_version);
    let current = input
        .facts
        .as_ref()
        .and_then(|f| FirmwareVersion::parse(&f.version));

    if !input.reachable {
        blocked = true;
        risk = RiskLevel::High;
        prerequisites.push("restore management reachability to the device".to_string());
    }

    if input.reachable && input.storage.is_none() {
        blocked = true;
        risk = risk.max(RiskLevel::Medium);
        prerequisites.push("could not read device storage; retry the readiness check".to_string());
    }

    match &input.image {
        Some(image) => {
            if let Some(storage) = input.storage {
                let required = config.required_free_bytes(image.size_bytes);
                if storage.available_bytes < required {
                    blocked = true;
                    risk = RiskLevel::High;
                    prerequisites.push(format!(
                        "free storage: {} bytes available, {} required",
                        storage.available_bytes, required
                    ));
                }
            }
        }
        None => {
            blocked = true;
            let dir = target
                .as_ref()
                .map(|t| t.major_dir())
                .unwrap_or_else(|| "<major>.x".to_string());
            prerequisites.push(format!(
                "stage image for {} under {}/{}",
                input.target_version,
                config.firmware_dir.display(),
                dir
            ));
        }
    }

    if let (Some(current), Some(target)) = (&current, &target) {
        if current == target {
            blocked = true;
            warnings.push(format!("device already runs {}", target));
        } else if target < current {
            risk = risk.max(RiskLevel::Medium);
            warnings.push(format!("downgrade from {} to {}", current, target));
        } else if target.major() > current.major() + 1 {
            blocked = true;
            risk = RiskLevel::High;
            prerequisites.push(format!(
                "upgrade through an intermediate {}.x release first",
                current.major() + 1
            ));
        }
    }

    if let Some(bytes) = input.config_bytes {
        if bytes > config.large_config_bytes {
            risk = risk.max(RiskLevel::Medium);
            warnings.push(format!(
                "large configuration ({} bytes) lengthens commit and reboot times",
                bytes
            ));
        }
    }

    ReadinessReport {
        device_id: input.device_id.clone(),
        target_version: input.target_version.clone(),
        current_version: input.facts.as_ref().map(|f| f.version.clone()),
        model: input.facts.as_ref().map(|f| f.model.clone()),
        ready: !blocked && prerequisites.is_empty(),
        risk,
        prerequisites,
        warnings,
        image: input.image.clone(),
        available_bytes: input.storage.map(|s| s.available_bytes),
        config_bytes: input.config_bytes,
        checked_at: Utc::now(),
    }
}

/// Latest readiness report per device, valid for a fixed TTL.
pub struct ReadinessCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, ReadinessReport)>>,
}

impl ReadinessCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self, report: ReadinessReport) {
        self.entries
            .lock()
            .unwrap()
            .insert(report.device_id.clone(), (Instant::now(), report));
    }

    /// The unexpired report for `device_id` and `target_version`, if any.
    pub fn get(&self, device_id: &str, target_version: &str) -> Option<ReadinessReport> {
        let entries = self.entries.lock().unwrap();
        let (at, report) = entries.get(device_id)?;
        (at.elapsed() < self.ttl && report.target_version == target_version).then(|| report.clone())
    }

    pub fn invalidate(&self, device_id: &str) {
        self.entries.lock().unwrap().remove(device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn image(version: &str, size: u64) -> FirmwareImage {
        FirmwareImage {
            version: version.to_string(),
            file_name: format!("junos-srxsme-{}.tgz", version),
            path: PathBuf::from("/tmp/none"),
            size_bytes: size,
            major_dir: "x".to_string(),
        }
    }

    fn input(current: &str, target: &str) -> ReadinessInput {
        ReadinessInput {
            device_id: "42".to_string(),
            target_version: target.to_string(),
            reachable: true,
            facts: Some(DeviceFacts {
                model: "srx345".to_string(),
                version: current.to_string(),
                uptime_secs: 1000,
                hostname: None,
                serial: None,
            }),
            storage: Some(StorageInfo {
                total_bytes: 1000,
                available_bytes: 800,
            }),
            config_bytes: Some(10_000),
            image: Some(image(target, 300)),
        }
    }

    #[test]
    fn test_ready_minor_upgrade() {
        let report = assess(&input("21.4R3", "22.1R1"), &UpgradeConfig::default());
        assert!(report.ready);
        assert_eq!(report.risk, RiskLevel::Low);
        assert!(report.prerequisites.is_empty());
        assert_eq!(report.current_version.as_deref(), Some("21.4R3"));
    }

    #[test]
    fn test_low_disk_blocks() {
        let mut input = input("21.4R3", "22.1R1");
        input.storage = Some(StorageInfo {
            total_bytes: 1000,
            available_bytes: 500,
        });
        let report = assess(&input, &UpgradeConfig::default());
        assert!(!report.ready);
        assert_eq!(report.risk, RiskLevel::High);
        assert!(report.prerequisites[0].contains("600 required"));
    }

    #[test]
    fn test_missing_image_blocks() {
        let mut input = input("21.4R3", "22.1R1");
        input.image = None;
        let report = assess(&input, &UpgradeConfig::default());
        assert!(!report.ready);
        assert!(report.prerequisites[0].contains("firmware/22.x"));
    }

    #[test]
    fn test_same_version_not_ready() {
        let report = assess(&input("22.1R1", "22.1R1"), &UpgradeConfig::default());
        assert!(!report.ready);
        assert!(report.warnings[0].contains("already runs"));
    }

    #[test]
    fn test_major_jump_needs_intermediate() {
        let report = assess(&input("20.4R3", "23.4R2.13"), &UpgradeConfig::default());
        assert!(!report.ready);
        assert_eq!(report.risk, RiskLevel::High);
        assert!(report.prerequisites[0].contains("21.x"));
    }

    #[test]
    fn test_downgrade_and_large_config_are_medium() {
        let mut input = input("22.1R1", "21.4R3");
        input.config_bytes = Some(1024 * 1024);
        let report = assess(&input, &UpgradeConfig::default());
        assert!(report.ready);
        assert_eq!(report.risk, RiskLevel::Medium);
        assert_eq!(report.warnings.len(), 2);
    }

    #[test]
    fn test_unreachable_not_ready() {
        let mut input = input("21.4R3", "22.1R1");
        input.reachable = false;
        input.facts = None;
        input.storage = None;
        let report = assess(&input, &UpgradeConfig::default());
        assert!(!report.ready);
        assert_eq!(report.risk, RiskLevel::High);
        assert!(report.current_version.is_none());
    }

    #[test]
    fn test_unknown_storage_blocks() {
        let mut input = input("21.4R3", "22.1R1");
        input.storage = None;
        let report = assess(&input, &UpgradeConfig::default());
        assert!(!report.ready);
        assert_eq!(report.risk, RiskLevel::Medium);
        assert!(report.prerequisites[0].contains("could not read device storage"));
        assert!(report.available_bytes.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_ttl_and_target() {
        let cache = ReadinessCache::new(Duration::from_secs(60));
        cache.store(assess(&input("21.4R3", "22.1R1"), &UpgradeConfig::default()));

        assert!(cache.get("42", "22.1R1").is_some());
        assert!(cache.get("42", "22.2R1").is_none());
        assert!(cache.get("43", "22.1R1").is_none());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(cache.get("42", "22.1R1").is_none());
    }
}
