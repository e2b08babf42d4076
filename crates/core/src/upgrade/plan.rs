use super::config::UpgradeConfig;
use super::types::{FirmwareImage, PlanStep, ReadinessReport, UpgradePhase, UpgradePlan};

fn describe(phase: UpgradePhase, image: &FirmwareImage, target: &str) -> String {
    match phase {
        UpgradePhase::PreChecks => "Confirm reachability, current version and free storage".to_string(),
        UpgradePhase::PreBackup => "Snapshot the running configuration (pre-upgrade)".to_string(),
        UpgradePhase::ImageTransfer => format!(
            "Copy {} ({} bytes) to the device",
            image.file_name, image.size_bytes
        ),
        UpgradePhase::ChecksumValidation => {
            "Compare the on-device SHA-256 with the catalog image; stop on mismatch".to_string()
        }
        UpgradePhase::Install => format!("Install the {} package", target),
        UpgradePhase::Reboot => "Reboot into the new release".to_string(),
        UpgradePhase::ReachabilityWait => {
            "Poll until the device answers again, with exponential backoff".to_string()
        }
        UpgradePhase::PostValidation => format!("Verify the device reports version {}", target),
        UpgradePhase::PostBackup => "Snapshot the running configuration (post-upgrade)".to_string(),
    }
}

fn estimate(phase: UpgradePhase, image: &FirmwareImage, config: &UpgradeConfig) -> u64 {
    match phase {
        UpgradePhase::PreChecks | UpgradePhase::PreBackup | UpgradePhase::PostBackup => 30,
        UpgradePhase::ImageTransfer => {
            image.size_bytes / config.transfer_rate_bytes_per_sec.max(1) + 1
        }
        UpgradePhase::ChecksumValidation => 60,
        UpgradePhase::Install => config.install_estimate_secs,
        UpgradePhase::Reboot => config.reachability.reboot_grace_secs,
        UpgradePhase::ReachabilityWait => config.reachability.max_interval_secs * 2,
        UpgradePhase::PostValidation => 30,
    }
}

/// Build the advisory phase list for upgrading to `readiness.target_version`.
pub fn build_plan(
    readiness: &ReadinessReport,
    image: &FirmwareImage,
    config: &UpgradeConfig,
) -> UpgradePlan {
    let target = readiness.target_version.as_str();
    let steps: Vec<PlanStep> = UpgradePhase::ALL
        .iter()
        .enumerate()
        .map(|(i, &phase)| PlanStep {
            order: i + 1,
            phase,
            description: describe(phase, image, target),
            estimated_secs: estimate(phase, image, config),
        })
        .collect();
    let estimated_total_secs = steps.iter().map(|s| s.estimated_secs).sum();

    let previous = readiness
        .current_version
        .clone()
        .unwrap_or_else(|| "the previous release".to_string());
    let rollback_procedure = vec![
        format!("Request a rollback to {} from the device's alternate boot image", previous),
        "Reboot and wait for the device to answer".to_string(),
        format!("Verify the device reports {}", previous),
        "Compare the running configuration with the pre-upgrade snapshot".to_string(),
    ];

    let mut warnings = readiness.warnings.clone();
    warnings.extend(readiness.prerequisites.iter().map(|p| format!("prerequisite: {}", p)));

    UpgradePlan {
        device_id: readiness.device_id.clone(),
        current_version: readiness.current_version.clone(),
        target_version: target.to_string(),
        image: image.clone(),
        steps,
        estimated_total_secs,
        rollback_procedure,
        risk: readiness.risk,
        warnings,
    }
}
