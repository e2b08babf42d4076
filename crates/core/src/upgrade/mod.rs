//! Firmware upgrades: catalog, readiness, plans and staged execution.

mod config;
mod firmware;
mod orchestrator;
mod plan;
mod readiness;
mod types;
mod version;

pub use config::{ReachabilityWait, UpgradeConfig};
pub use firmware::FirmwareCatalog;
pub use orchestrator::UpgradeOrchestrator;
pub use plan::build_plan;
pub use readiness::{assess, ReadinessCache, ReadinessInput};
pub use types::{
    FirmwareImage, PhaseResult, PhaseStatus, PlanStep, ReadinessReport, RiskLevel, UpgradeError,
    UpgradeOutcome, UpgradePhase, UpgradePlan, UpgradeReport, UpgradeRequest,
};
pub use version::{version_from_file_name, FirmwareVersion};
