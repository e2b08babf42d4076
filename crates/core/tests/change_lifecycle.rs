//! Commit-confirm lifecycle integration tests.
//!
//! These tests drive configuration changes through the dispatcher against
//! the fake transport, with a paused clock:
//! pending -> running -> {confirmed | rolled back | unreachable}

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use fleetguard_core::{
    create_audit_system,
    testing::{fixtures, FakeTransport},
    AuditFilter, AuditStore, ChangeReport, ChangeRequest, CommitConfirmConfig, DispatchError,
    DispatcherConfig, FailureKind, Job, JobLedger, JobStatus, SnapshotStore, SnapshotTrigger,
    SqliteAuditStore, SqliteJobLedger, SqliteSnapshotStore, StaticDeviceDirectory, TaskDispatcher,
    UpgradeConfig,
};

/// Test helper wiring a dispatcher over one SQLite file.
struct TestHarness {
    dispatcher: TaskDispatcher,
    transport: Arc<FakeTransport>,
    ledger: Arc<SqliteJobLedger>,
    snapshots: Arc<SqliteSnapshotStore>,
    audit_store: Arc<SqliteAuditStore>,
    _temp_dir: TempDir,
}

impl TestHarness {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("fleetguard.db");

        let ledger = Arc::new(SqliteJobLedger::new(&db_path).expect("Failed to create ledger"));
        let snapshots = Arc::new(
            SqliteSnapshotStore::new(&db_path, temp_dir.path().join("repo"))
                .expect("Failed to create snapshot store"),
        );
        let audit_store =
            Arc::new(SqliteAuditStore::new(&db_path).expect("Failed to create audit store"));
        let (audit, writer) =
            create_audit_system(Arc::clone(&audit_store) as Arc<dyn AuditStore>, 256);
        tokio::spawn(writer.run());

        let transport = Arc::new(FakeTransport::new().with_device("42", fixtures::BASE_CONFIG));
        let devices = StaticDeviceDirectory::new(vec![fixtures::device("42")]);

        let dispatcher = TaskDispatcher::new(
            DispatcherConfig::default(),
            Arc::clone(&ledger) as Arc<dyn JobLedger>,
            Arc::clone(&snapshots) as Arc<dyn SnapshotStore>,
            Arc::new(devices),
            transport.clone(),
            CommitConfirmConfig::default(),
            UpgradeConfig::default(),
            Some(audit),
        );

        Self {
            dispatcher,
            transport,
            ledger,
            snapshots,
            audit_store,
            _temp_dir: temp_dir,
        }
    }

    async fn wait_for_terminal(&self, job_id: &str) -> Job {
        fixtures::wait_for_terminal(self.ledger.as_ref(), job_id).await
    }

    async fn wait_for_window(&self, job_id: &str) {
        fixtures::wait_for_window(self.dispatcher.change_engine().registry(), job_id).await
    }

    fn report(job: &Job) -> ChangeReport {
        serde_json::from_value(job.result.clone().expect("job has a result"))
            .expect("result is a change report")
    }
}

fn three_commands() -> Vec<String> {
    vec![
        "set system ntp server 10.0.0.2".to_string(),
        "set system syslog host 10.0.0.9 any warning".to_string(),
        "set snmp community monitor authorization read-only".to_string(),
    ]
}

#[tokio::test(start_paused = true)]
async fn test_confirm_at_two_minutes_of_five() {
    let h = TestHarness::new();
    let job = h
        .dispatcher
        .trigger_apply_change("42", ChangeRequest::new(three_commands(), "ntp/syslog/snmp"), "alice")
        .await
        .unwrap();

    h.wait_for_window(&job.id).await;
    tokio::time::sleep(Duration::from_secs(120)).await;
    h.dispatcher.confirm(&job.id).unwrap();

    let done = h.wait_for_terminal(&job.id).await;
    assert_eq!(done.status, JobStatus::Success);
    assert!(done.failure.is_none());

    let report = TestHarness::report(&done);
    assert!(report.confirmed);
    assert_eq!(report.timeout_secs, 300);
    let pre = report.pre_snapshot_id.unwrap();
    let post = report.post_snapshot_id.unwrap();
    assert_ne!(pre, post);
    assert_ne!(
        h.snapshots.retrieve(&pre).unwrap(),
        h.snapshots.retrieve(&post).unwrap()
    );

    let history = h.dispatcher.list_snapshots("42", 10, 0).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].trigger, SnapshotTrigger::PostChange);
    assert_eq!(history[1].trigger, SnapshotTrigger::PreChange);
    assert_eq!(history[0].job_id.as_deref(), Some(job.id.as_str()));

    let diff = h.dispatcher.diff_snapshots(&pre, &post).unwrap();
    assert!(diff.contains("+set snmp community monitor authorization read-only"));
}

#[tokio::test(start_paused = true)]
async fn test_confirmed_change_without_effect_needs_attention() {
    let h = TestHarness::new();
    let request = ChangeRequest::new(
        vec!["set system ntp server 10.0.0.1".to_string()],
        "already present",
    );
    let job = h
        .dispatcher
        .trigger_apply_change("42", request, "alice")
        .await
        .unwrap();

    h.wait_for_window(&job.id).await;
    h.dispatcher.confirm(&job.id).unwrap();

    let done = h.wait_for_terminal(&job.id).await;
    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.failure, Some(FailureKind::NoEffectiveChange));
    assert!(done.needs_attention);

    let report = TestHarness::report(&done);
    assert!(report.confirmed);
    assert!(report.discrepancy.is_some());
    let pre = report.pre_snapshot_id.unwrap();
    let post = report.post_snapshot_id.unwrap();
    assert_eq!(
        h.snapshots.retrieve(&pre).unwrap(),
        h.snapshots.retrieve(&post).unwrap()
    );
    assert!(h.ledger.lock_holder("42").unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_unconfirmed_change_rolls_back() {
    let h = TestHarness::new();
    let request = ChangeRequest::new(three_commands(), "forgotten").with_timeout_secs(1);
    let job = h
        .dispatcher
        .trigger_apply_change("42", request, "alice")
        .await
        .unwrap();

    let done = h.wait_for_terminal(&job.id).await;
    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.failure, Some(FailureKind::RollbackOccurred));
    assert!(!done.needs_attention);

    let report = TestHarness::report(&done);
    assert!(!report.confirmed);
    assert_eq!(
        h.snapshots
            .retrieve(report.pre_snapshot_id.as_deref().unwrap())
            .unwrap(),
        h.snapshots
            .retrieve(report.post_snapshot_id.as_deref().unwrap())
            .unwrap()
    );
    assert_eq!(h.transport.running_config("42"), fixtures::BASE_CONFIG);

    // A late confirmation has nothing to confirm.
    assert!(matches!(
        h.dispatcher.confirm(&job.id),
        Err(DispatchError::NotAwaitingConfirmation(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_second_change_rejected_during_window() {
    let h = TestHarness::new();
    let first = h
        .dispatcher
        .trigger_apply_change("42", ChangeRequest::new(three_commands(), "first"), "alice")
        .await
        .unwrap();
    h.wait_for_window(&first.id).await;

    let second = h
        .dispatcher
        .trigger_apply_change(
            "42",
            ChangeRequest::new(vec!["set system domain-name example.net".into()], "second"),
            "bob",
        )
        .await;
    match second {
        Err(DispatchError::DeviceLocked { holder, .. }) => assert_eq!(holder, first.id),
        other => panic!("expected DeviceLocked, got {:?}", other),
    }

    h.dispatcher.confirm(&first.id).unwrap();
    assert_eq!(h.wait_for_terminal(&first.id).await.status, JobStatus::Success);

    // A different change is accepted as soon as the first one is done.
    let third = h
        .dispatcher
        .trigger_apply_change(
            "42",
            ChangeRequest::new(vec!["set system domain-name example.net".into()], "third"),
            "bob",
        )
        .await;
    assert!(third.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_device_lost_for_good_needs_reconciliation() {
    let h = TestHarness::new();
    h.transport.dark_after_commit("42", Duration::from_secs(24 * 3600));
    let request = ChangeRequest::new(three_commands(), "cut the branch off").with_timeout_secs(60);
    let job = h
        .dispatcher
        .trigger_apply_change("42", request, "alice")
        .await
        .unwrap();

    let done = h.wait_for_terminal(&job.id).await;
    assert_eq!(done.failure, Some(FailureKind::UnreachableError));
    assert!(done.needs_attention);
    assert!(h.ledger.lock_holder("42").unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let lost = h
        .audit_store
        .query(
            &AuditFilter::new()
                .with_job_id(&job.id)
                .with_event_type("reconciliation_failed"),
        )
        .unwrap();
    assert_eq!(lost.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_syntax_error_leaves_no_trace_on_device() {
    let h = TestHarness::new();
    h.transport.set_syntax_error("42", Some("syntax error at 'sett'"));
    let job = h
        .dispatcher
        .trigger_apply_change("42", ChangeRequest::new(vec!["sett system".into()], "typo"), "alice")
        .await
        .unwrap();

    let done = h.wait_for_terminal(&job.id).await;
    assert_eq!(done.failure, Some(FailureKind::ValidationError));
    assert!(done.error.unwrap().contains("sett"));
    assert_eq!(h.snapshots.count("42").unwrap(), 0);
    assert_eq!(h.transport.call_count("commit"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_audit_trail_for_confirmed_change() {
    let h = TestHarness::new();
    let request = ChangeRequest::new(three_commands(), "audited").with_auto_confirm();
    let job = h
        .dispatcher
        .trigger_apply_change("42", request, "alice")
        .await
        .unwrap();
    assert_eq!(h.wait_for_terminal(&job.id).await.status, JobStatus::Success);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let types: Vec<String> = h
        .audit_store
        .query(&AuditFilter::new().with_job_id(&job.id))
        .unwrap()
        .into_iter()
        .rev()
        .map(|r| r.event_type)
        .collect();
    assert_eq!(types.first().map(String::as_str), Some("job_created"));
    assert_eq!(types.last().map(String::as_str), Some("job_state_changed"));
    for expected in ["change_committed", "change_confirmed", "snapshot_taken"] {
        assert!(types.iter().any(|t| t == expected), "missing {}", expected);
    }
}
