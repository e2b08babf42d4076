//! Firmware upgrade integration tests.
//!
//! Upgrades are driven through the dispatcher: readiness check, plan,
//! initiate, then the phase pipeline against the fake transport.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

use fleetguard_core::{
    testing::{fixtures, FakeTransport},
    upgrade::{PhaseStatus, UpgradeOutcome, UpgradePhase, UpgradeReport},
    CommitConfirmConfig, DispatchError, DispatcherConfig, FailureKind, Job, JobFilter, JobLedger,
    JobStatus, RiskLevel, SnapshotStore, SqliteJobLedger, SqliteSnapshotStore, StaticDeviceDirectory,
    TaskDispatcher, UpgradeConfig,
};

const TARGET: &str = "21.4R3";

struct TestHarness {
    dispatcher: TaskDispatcher,
    transport: Arc<FakeTransport>,
    ledger: Arc<SqliteJobLedger>,
    snapshots: Arc<SqliteSnapshotStore>,
    _temp_dir: TempDir,
}

impl TestHarness {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("fleetguard.db");
        let firmware_dir = temp_dir.path().join("firmware");
        fixtures::stage_firmware(&firmware_dir, TARGET);

        let ledger = Arc::new(SqliteJobLedger::new(&db_path).expect("Failed to create ledger"));
        let snapshots = Arc::new(
            SqliteSnapshotStore::new(&db_path, temp_dir.path().join("repo"))
                .expect("Failed to create snapshot store"),
        );
        let transport = Arc::new(FakeTransport::new().with_device("42", fixtures::BASE_CONFIG));

        let dispatcher = TaskDispatcher::new(
            DispatcherConfig::default(),
            Arc::clone(&ledger) as Arc<dyn JobLedger>,
            Arc::clone(&snapshots) as Arc<dyn SnapshotStore>,
            Arc::new(StaticDeviceDirectory::new(vec![fixtures::device("42")])),
            transport.clone(),
            CommitConfirmConfig::default(),
            UpgradeConfig {
                firmware_dir,
                ..Default::default()
            },
            None,
        );

        Self {
            dispatcher,
            transport,
            ledger,
            snapshots,
            _temp_dir: temp_dir,
        }
    }

    /// Check readiness, then start the upgrade.
    async fn upgrade(&self) -> Job {
        let readiness = self
            .dispatcher
            .check_upgrade_readiness("42", TARGET)
            .await
            .unwrap();
        assert!(readiness.ready, "not ready: {:?}", readiness.prerequisites);
        let job = self
            .dispatcher
            .initiate_upgrade("42", TARGET, "alice")
            .await
            .unwrap();
        fixtures::wait_for_terminal(self.ledger.as_ref(), &job.id).await
    }

    fn report(job: &Job) -> UpgradeReport {
        serde_json::from_value(job.result.clone().expect("job has a result"))
            .expect("result is an upgrade report")
    }
}

fn phase_status(report: &UpgradeReport, phase: UpgradePhase) -> Option<PhaseStatus> {
    report
        .phases
        .iter()
        .find(|p| p.phase == phase)
        .map(|p| p.status)
}

#[tokio::test(start_paused = true)]
async fn test_upgrade_to_validated_success() {
    let h = TestHarness::new();
    let plan = h.dispatcher.generate_upgrade_plan("42", TARGET).await.unwrap();
    assert_eq!(plan.steps.len(), 9);
    assert_eq!(plan.current_version.as_deref(), Some("20.4R3"));

    let done = h.upgrade().await;
    assert_eq!(done.status, JobStatus::Success);

    let report = TestHarness::report(&done);
    assert_eq!(report.outcome, Some(UpgradeOutcome::ValidatedSuccess));
    assert_eq!(report.previous_version.as_deref(), Some("20.4R3"));
    assert_eq!(report.new_version.as_deref(), Some(TARGET));
    assert_eq!(report.expected_checksum, report.remote_checksum);
    assert!(report
        .phases
        .iter()
        .all(|p| p.status == PhaseStatus::Completed));
    assert_eq!(h.transport.version("42").as_deref(), Some(TARGET));
    assert_eq!(h.transport.reboot_count("42"), 1);
    assert_eq!(h.snapshots.count("42").unwrap(), 2);

    // A finished run consumes the readiness check.
    assert!(matches!(
        h.dispatcher.initiate_upgrade("42", TARGET, "alice").await,
        Err(DispatchError::UpgradeNotReady { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_not_ready_device_gets_no_job() {
    let h = TestHarness::new();
    h.transport.set_storage("42", 1024, 16);

    let readiness = h
        .dispatcher
        .check_upgrade_readiness("42", TARGET)
        .await
        .unwrap();
    assert!(!readiness.ready);

    let result = h.dispatcher.initiate_upgrade("42", TARGET, "alice").await;
    assert!(matches!(result, Err(DispatchError::UpgradeNotReady { .. })));
    assert_eq!(h.dispatcher.count_jobs(&JobFilter::new()).unwrap(), 0);
    assert!(h.ledger.lock_holder("42").unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_unreadable_storage_blocks_initiation() {
    let h = TestHarness::new();
    h.transport.fail_storage_reads("42");

    let readiness = h
        .dispatcher
        .check_upgrade_readiness("42", TARGET)
        .await
        .unwrap();
    assert!(!readiness.ready);
    assert!(readiness.risk >= RiskLevel::Medium);
    assert!(readiness.available_bytes.is_none());
    assert!(readiness
        .prerequisites
        .iter()
        .any(|p| p.contains("could not read device storage")));

    let result = h.dispatcher.initiate_upgrade("42", TARGET, "alice").await;
    assert!(matches!(result, Err(DispatchError::UpgradeNotReady { .. })));
    assert_eq!(h.dispatcher.count_jobs(&JobFilter::new()).unwrap(), 0);
    assert_eq!(h.transport.reboot_count("42"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_target_has_no_image() {
    let h = TestHarness::new();
    assert_err!(h.dispatcher.check_upgrade_readiness("42", "99.1R1").await);
    assert_err!(h.dispatcher.initiate_upgrade("42", "99.1R1", "alice").await);
    assert_ok!(h.dispatcher.generate_upgrade_plan("42", TARGET).await);
}

#[tokio::test(start_paused = true)]
async fn test_checksum_mismatch_never_reboots() {
    let h = TestHarness::new();
    h.transport.corrupt_transfers("42");

    let done = h.upgrade().await;
    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.failure, Some(FailureKind::ChecksumMismatch));
    assert!(!done.needs_attention);

    let report = TestHarness::report(&done);
    assert_ne!(report.expected_checksum, report.remote_checksum);
    assert_eq!(
        phase_status(&report, UpgradePhase::ChecksumValidation),
        Some(PhaseStatus::Failed)
    );
    assert_eq!(phase_status(&report, UpgradePhase::Install), None);
    assert_eq!(h.transport.reboot_count("42"), 0);
    assert_eq!(h.transport.version("42").as_deref(), Some("20.4R3"));
}

#[tokio::test(start_paused = true)]
async fn test_wrong_version_after_reboot_needs_manual_rollback() {
    let h = TestHarness::new();
    h.transport.set_boot_version("42", "20.4R3");

    let done = h.upgrade().await;
    assert_eq!(done.failure, Some(FailureKind::ValidationFailedPostUpgrade));
    assert!(done.needs_attention);
    assert!(done.error.as_ref().unwrap().contains("manual rollback"));

    let report = TestHarness::report(&done);
    assert_eq!(report.outcome, Some(UpgradeOutcome::ValidationFailed));
    assert_eq!(report.new_version.as_deref(), Some("20.4R3"));
    assert!(report.post_snapshot_id.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_device_that_stays_down_times_out() {
    let h = TestHarness::new();
    h.transport.set_reboot_downtime(Duration::from_secs(6 * 3600));

    let done = h.upgrade().await;
    assert_eq!(done.failure, Some(FailureKind::UnreachableTimeout));
    assert!(done.needs_attention);

    let report = TestHarness::report(&done);
    assert_eq!(report.outcome, Some(UpgradeOutcome::UnreachableTimeout));
    assert_eq!(
        phase_status(&report, UpgradePhase::ReachabilityWait),
        Some(PhaseStatus::Failed)
    );
    assert!(report.post_snapshot_id.is_none());
}
