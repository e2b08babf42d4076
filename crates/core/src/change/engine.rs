//! Commit-confirm engine.
//!
//! Drives one apply-change job through
//! `validating → staged → confirm-window → {confirmed | rolled-back}`.
//! The device owns the auto-revert timer; the engine only has to decide,
//! once the window is over, what the device actually ended up running.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditHandle};
use crate::device::{
    reconnect_until, wait_until_reachable, CommitHandle, Device, DeviceSession, DeviceTransport,
    TransportError,
};
use crate::ledger::{FailureKind, Job, JobLedger, JobOutcome};
use crate::metrics;
use crate::snapshot::{
    capture_snapshot, sha256_hex, Snapshot, SnapshotError, SnapshotRequest, SnapshotStore,
    SnapshotTrigger,
};

use super::config::CommitConfirmConfig;
use super::registry::ConfirmRegistry;
use super::types::{ChangeError, ChangePhase, ChangeReport, ChangeRequest, ConfirmationSource};

/// How the confirm window ended.
enum WindowOutcome {
    Confirmed(ConfirmationSource),
    Expired,
    /// The device refused the confirm. It reverts by itself at expiry.
    ConfirmRejected(TransportError),
}

enum ReconcileFailure {
    /// The device did not come back before the reconciliation ceiling.
    Ceiling,
    Transport(TransportError),
}

struct RunContext<'a> {
    job: &'a Job,
    device: &'a Device,
    report: ChangeReport,
    lost_contact: bool,
}

pub struct CommitConfirmEngine {
    config: CommitConfirmConfig,
    transport: Arc<dyn DeviceTransport>,
    snapshots: Arc<dyn SnapshotStore>,
    ledger: Arc<dyn JobLedger>,
    registry: Arc<ConfirmRegistry>,
    audit: AuditHandle,
}

impl CommitConfirmEngine {
    pub fn new(
        config: CommitConfirmConfig,
        transport: Arc<dyn DeviceTransport>,
        snapshots: Arc<dyn SnapshotStore>,
        ledger: Arc<dyn JobLedger>,
        audit: Option<AuditHandle>,
    ) -> Self {
        Self {
            config,
            transport,
            snapshots,
            ledger,
            registry: Arc::new(ConfirmRegistry::new()),
            audit: audit.unwrap_or_else(AuditHandle::disabled),
        }
    }

    pub fn config(&self) -> &CommitConfirmConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConfirmRegistry> {
        &self.registry
    }

    /// The confirm window for a request, checked against the configured bounds.
    pub fn resolve_timeout(&self, requested: Option<u64>) -> Result<Duration, ChangeError> {
        let secs = requested.unwrap_or(self.config.default_timeout_secs);
        if secs < self.config.min_timeout_secs || secs > self.config.max_timeout_secs {
            return Err(ChangeError::TimeoutOutOfRange {
                requested: secs,
                min: self.config.min_timeout_secs,
                max: self.config.max_timeout_secs,
            });
        }
        Ok(Duration::from_secs(secs))
    }

    /// Operator confirmation of an open window.
    pub fn confirm(&self, job_id: &str) -> Result<(), ChangeError> {
        self.registry.confirm(job_id, ConfirmationSource::Operator)
    }

    /// Run an apply-change job to its outcome. Never returns early without one.
    pub async fn run(&self, job: &Job, device: &Device, request: &ChangeRequest) -> JobOutcome {
        let timeout = match self.resolve_timeout(request.timeout_secs) {
            Ok(timeout) => timeout,
            Err(e) => {
                return JobOutcome::failed(
                    FailureKind::ValidationError,
                    e.to_string(),
                    serde_json::json!({}),
                )
            }
        };

        let mut ctx = RunContext {
            job,
            device,
            report: ChangeReport::new(request, timeout.as_secs()),
            lost_contact: false,
        };

        let mut session = match self.transport.connect(device).await {
            Ok(session) => session,
            Err(e) => {
                return self.fail(&mut ctx, FailureKind::Transport, format!("connect failed: {}", e))
            }
        };

        let outcome = if request.commands.is_empty() {
            self.run_without_changes(&mut ctx, &session).await
        } else {
            self.drive(&mut ctx, &mut session, request, timeout).await
        };

        if let Err(e) = self.transport.disconnect(&session).await {
            debug!(job_id = %job.id, "Disconnect after change failed: {}", e);
        }
        outcome
    }

    async fn run_without_changes(
        &self,
        ctx: &mut RunContext<'_>,
        session: &DeviceSession,
    ) -> JobOutcome {
        let pre = match self.snapshot_running(ctx, session, SnapshotTrigger::PreChange).await {
            Ok(snapshot) => snapshot,
            Err(outcome) => return outcome,
        };
        ctx.report.pre_snapshot_id = Some(pre.id.clone());
        self.enter(ctx, ChangePhase::PreSnapshot, Some(pre.id.clone()));

        let post = match self.snapshot_running(ctx, session, SnapshotTrigger::PostChange).await {
            Ok(snapshot) => snapshot,
            Err(outcome) => return outcome,
        };
        ctx.report.post_snapshot_id = Some(post.id.clone());
        ctx.report.diff = self.diff(&pre, &post);
        ctx.report.summary = Some("no changes".to_string());
        self.enter(ctx, ChangePhase::PostSnapshot, Some(post.id));

        info!(job_id = %ctx.job.id, device_id = %ctx.device.id, "Empty change set, nothing committed");
        JobOutcome::success(ctx.report.to_value())
    }

    async fn drive(
        &self,
        ctx: &mut RunContext<'_>,
        session: &mut DeviceSession,
        request: &ChangeRequest,
        timeout: Duration,
    ) -> JobOutcome {
        self.enter(ctx, ChangePhase::Validating, None);
        match self.transport.validate(session, &request.commands).await {
            Ok(()) => {}
            Err(TransportError::Syntax(msg)) => {
                return self.fail(
                    ctx,
                    FailureKind::ValidationError,
                    format!("validation failed: {}", msg),
                )
            }
            Err(e) => return self.fail(ctx, FailureKind::Transport, e.to_string()),
        }

        let pre = match self.snapshot_running(ctx, session, SnapshotTrigger::PreChange).await {
            Ok(snapshot) => snapshot,
            Err(outcome) => return outcome,
        };
        ctx.report.pre_snapshot_id = Some(pre.id.clone());
        self.enter(ctx, ChangePhase::PreSnapshot, Some(pre.id.clone()));

        if let Err(e) = self.transport.push_candidate(session, &request.commands).await {
            return self.fail(ctx, FailureKind::Transport, format!("staging failed: {}", e));
        }
        self.enter(
            ctx,
            ChangePhase::Staged,
            Some(format!("{} commands", request.commands.len())),
        );

        let comment = format!("fleetguard job {}: {}", ctx.job.id, request.description);
        let committed_at = Instant::now();
        let deadline = committed_at + timeout;

        let window = match self
            .transport
            .commit_confirmed(session, timeout, &comment)
            .await
        {
            Ok(handle) => {
                ctx.report.commit_id = Some(handle.commit_id.clone());
                self.enter(
                    ctx,
                    ChangePhase::ConfirmWindow,
                    Some(format!("auto-revert in {}s", timeout.as_secs())),
                );
                self.audit
                    .emit(AuditEvent::ChangeCommitted {
                        job_id: ctx.job.id.clone(),
                        device_id: ctx.device.id.clone(),
                        commit_id: handle.commit_id.clone(),
                        confirm_timeout_secs: timeout.as_secs(),
                        command_count: request.commands.len(),
                    })
                    .await;
                info!(
                    job_id = %ctx.job.id,
                    device_id = %ctx.device.id,
                    commit_id = %handle.commit_id,
                    timeout_secs = timeout.as_secs(),
                    "Change committed, confirm window open"
                );
                self.await_window(ctx, session, &handle, request.auto_confirm, deadline)
                    .await
            }
            Err(e) if e.is_unreachable() => {
                // The commit may or may not have landed. Without a handle it
                // cannot be confirmed, so let the window run out and verify.
                self.lost_contact(ctx, format!("during commit: {}", e)).await;
                sleep_until(deadline).await;
                WindowOutcome::Expired
            }
            Err(e) => return self.fail(ctx, FailureKind::Transport, format!("commit failed: {}", e)),
        };

        self.finish_window(ctx, session, &pre, window, committed_at, timeout)
            .await
    }

    async fn await_window(
        &self,
        ctx: &mut RunContext<'_>,
        session: &DeviceSession,
        handle: &CommitHandle,
        auto_confirm: bool,
        deadline: Instant,
    ) -> WindowOutcome {
        let job_id = ctx.job.id.clone();
        let mut rx = self.registry.open(&job_id);

        if auto_confirm {
            match self.transport.get_facts(session).await {
                Ok(facts) => {
                    debug!(job_id = %job_id, version = %facts.version, "Device answered after commit");
                    if let Err(e) = self.registry.confirm(&job_id, ConfirmationSource::Auto) {
                        debug!(job_id = %job_id, "Auto-confirm lost the race: {}", e);
                    }
                }
                Err(e) => {
                    warn!(job_id = %job_id, "Auto-confirm probe failed, waiting for the window: {}", e);
                }
            }
        }

        let fired = tokio::select! {
            res = &mut rx => Some(res),
            _ = sleep_until(deadline) => None,
        };
        let source = match fired {
            Some(Ok(source)) => source,
            Some(Err(_)) => {
                self.registry.close(&job_id);
                return WindowOutcome::Expired;
            }
            None => {
                if self.registry.close(&job_id) {
                    return WindowOutcome::Expired;
                }
                // A confirm removed the entry just as the timer fired.
                match rx.await {
                    Ok(source) => source,
                    Err(_) => return WindowOutcome::Expired,
                }
            }
        };

        let mut backoff = self.config.reconcile.backoff();
        loop {
            match self.transport.confirm(handle).await {
                Ok(()) => {
                    self.enter(ctx, ChangePhase::Confirmed, Some(source.as_str().to_string()));
                    self.audit
                        .emit(AuditEvent::ChangeConfirmed {
                            job_id: job_id.clone(),
                            device_id: ctx.device.id.clone(),
                            source: source.as_str().to_string(),
                        })
                        .await;
                    return WindowOutcome::Confirmed(source);
                }
                Err(e) if e.is_unreachable() => {
                    self.lost_contact(ctx, format!("while confirming: {}", e)).await;
                    let back = wait_until_reachable(
                        self.transport.as_ref(),
                        ctx.device,
                        &mut backoff,
                        deadline,
                    )
                    .await;
                    if !back || Instant::now() >= deadline {
                        return WindowOutcome::Expired;
                    }
                }
                Err(e) => {
                    warn!(job_id = %job_id, "Device rejected confirm: {}", e);
                    sleep_until(deadline).await;
                    return WindowOutcome::ConfirmRejected(e);
                }
            }
        }
    }

    async fn finish_window(
        &self,
        ctx: &mut RunContext<'_>,
        session: &mut DeviceSession,
        pre: &Snapshot,
        window: WindowOutcome,
        committed_at: Instant,
        timeout: Duration,
    ) -> JobOutcome {
        let ceiling = committed_at + self.config.reconcile.ceiling(timeout);
        if !matches!(window, WindowOutcome::Confirmed(_)) {
            self.enter(ctx, ChangePhase::Reconciling, None);
        }

        let content = match self.fetch_after_window(ctx, session, ceiling).await {
            Ok(content) => content,
            Err(ReconcileFailure::Ceiling) => {
                let waited = committed_at.elapsed().as_secs();
                metrics::CONFIRM_WINDOWS
                    .with_label_values(&["unreachable"])
                    .inc();
                self.audit
                    .emit(AuditEvent::ReconciliationFailed {
                        job_id: ctx.job.id.clone(),
                        device_id: ctx.device.id.clone(),
                        waited_secs: waited,
                    })
                    .await;
                return self.fail(
                    ctx,
                    FailureKind::UnreachableError,
                    format!(
                        "device unreachable for {}s after commit; manual reconciliation required",
                        waited
                    ),
                );
            }
            Err(ReconcileFailure::Transport(e)) => {
                return self
                    .fail(
                        ctx,
                        FailureKind::Transport,
                        format!("could not read configuration after window: {}", e),
                    )
                    .with_attention()
            }
        };

        let discrepancy = (sha256_hex(content.as_bytes()) != pre.content_hash)
            .then(|| format!("running configuration differs from pre-change snapshot {}", pre.id));
        if !matches!(window, WindowOutcome::Confirmed(_)) {
            ctx.report.discrepancy = discrepancy.clone();
            self.enter(ctx, ChangePhase::RolledBack, discrepancy.clone());
        }

        let post = match self
            .store_snapshot(ctx, content, SnapshotTrigger::PostChange)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                return self
                    .fail(ctx, FailureKind::Internal, format!("post-change snapshot: {}", e))
                    .with_attention()
            }
        };
        ctx.report.post_snapshot_id = Some(post.id.clone());
        ctx.report.diff = self.diff(pre, &post);
        self.enter(ctx, ChangePhase::PostSnapshot, Some(post.id.clone()));

        match window {
            WindowOutcome::Confirmed(source) => {
                ctx.report.confirmed = true;
                ctx.report.confirmed_by = Some(source);
                metrics::CONFIRM_WINDOWS
                    .with_label_values(&["confirmed"])
                    .inc();
                // Only reached with a non-empty command list.
                if discrepancy.is_none() {
                    let note = format!(
                        "confirmed commit left the running configuration identical to pre-change snapshot {}",
                        pre.id
                    );
                    ctx.report.discrepancy = Some(note.clone());
                    return self
                        .fail(ctx, FailureKind::NoEffectiveChange, note)
                        .with_attention();
                }
                info!(
                    job_id = %ctx.job.id,
                    device_id = %ctx.device.id,
                    source = source.as_str(),
                    "Change confirmed"
                );
                JobOutcome::success(ctx.report.to_value())
            }
            WindowOutcome::Expired => {
                metrics::CONFIRM_WINDOWS.with_label_values(&["expired"]).inc();
                self.audit
                    .emit(AuditEvent::ChangeRolledBack {
                        job_id: ctx.job.id.clone(),
                        device_id: ctx.device.id.clone(),
                        discrepancy: discrepancy.clone(),
                    })
                    .await;
                let outcome = JobOutcome::failed(
                    FailureKind::RollbackOccurred,
                    format!(
                        "confirm window of {}s elapsed without confirmation; device reverted",
                        ctx.report.timeout_secs
                    ),
                    ctx.report.to_value(),
                );
                match discrepancy {
                    Some(d) => {
                        warn!(job_id = %ctx.job.id, device_id = %ctx.device.id, "{}", d);
                        outcome.with_attention()
                    }
                    None => {
                        info!(job_id = %ctx.job.id, device_id = %ctx.device.id, "Change rolled back");
                        outcome
                    }
                }
            }
            WindowOutcome::ConfirmRejected(e) => {
                metrics::CONFIRM_WINDOWS
                    .with_label_values(&["rejected"])
                    .inc();
                self.audit
                    .emit(AuditEvent::ChangeRolledBack {
                        job_id: ctx.job.id.clone(),
                        device_id: ctx.device.id.clone(),
                        discrepancy,
                    })
                    .await;
                self.fail(
                    ctx,
                    FailureKind::Transport,
                    format!("device rejected confirm: {}", e),
                )
                .with_attention()
            }
        }
    }

    /// Read the running configuration once the window is over, reconnecting
    /// with backoff until `ceiling` if the device is away.
    async fn fetch_after_window(
        &self,
        ctx: &mut RunContext<'_>,
        session: &mut DeviceSession,
        ceiling: Instant,
    ) -> Result<String, ReconcileFailure> {
        let mut backoff = self.config.reconcile.backoff();
        loop {
            match self.transport.fetch_config(session).await {
                Ok(content) => return Ok(content),
                Err(e) if e.is_unreachable() => {
                    self.lost_contact(ctx, format!("after confirm window: {}", e))
                        .await;
                    let _ = self.transport.disconnect(session).await;
                    match reconnect_until(
                        self.transport.as_ref(),
                        ctx.device,
                        &mut backoff,
                        ceiling,
                    )
                    .await
                    {
                        Some(fresh) => *session = fresh,
                        None => return Err(ReconcileFailure::Ceiling),
                    }
                }
                Err(e) => return Err(ReconcileFailure::Transport(e)),
            }
        }
    }

    async fn snapshot_running(
        &self,
        ctx: &mut RunContext<'_>,
        session: &DeviceSession,
        trigger: SnapshotTrigger,
    ) -> Result<Snapshot, JobOutcome> {
        let content = self.transport.fetch_config(session).await.map_err(|e| {
            self.fail(
                ctx,
                FailureKind::Transport,
                format!("could not read configuration: {}", e),
            )
        })?;
        self.store_snapshot(ctx, content, trigger)
            .await
            .map_err(|e| self.fail(ctx, FailureKind::Internal, format!("{} snapshot: {}", trigger, e)))
    }

    async fn store_snapshot(
        &self,
        ctx: &RunContext<'_>,
        content: String,
        trigger: SnapshotTrigger,
    ) -> Result<Snapshot, SnapshotError> {
        let request = SnapshotRequest::for_device(ctx.device, content, trigger)
            .with_job(ctx.job.id.clone())
            .with_message(format!("{} for job {}", trigger, ctx.job.id));
        capture_snapshot(self.snapshots.as_ref(), &self.audit, request).await
    }

    fn diff(&self, pre: &Snapshot, post: &Snapshot) -> Option<String> {
        match self.snapshots.diff(&pre.id, &post.id) {
            Ok(diff) => Some(diff),
            Err(e) => {
                warn!(pre = %pre.id, post = %post.id, "Failed to diff snapshots: {}", e);
                None
            }
        }
    }

    async fn lost_contact(&self, ctx: &mut RunContext<'_>, context: String) {
        if ctx.lost_contact {
            return;
        }
        ctx.lost_contact = true;
        warn!(job_id = %ctx.job.id, device_id = %ctx.device.id, "Lost contact with device {}", context);
        self.enter(ctx, ChangePhase::ReachabilityLost, Some(context.clone()));
        self.audit
            .emit(AuditEvent::ReachabilityLost {
                job_id: ctx.job.id.clone(),
                device_id: ctx.device.id.clone(),
                context,
            })
            .await;
    }

    fn enter(&self, ctx: &mut RunContext<'_>, phase: ChangePhase, detail: Option<String>) {
        debug!(job_id = %ctx.job.id, ?phase, "Change phase");
        ctx.report.record(phase, detail);
        if let Err(e) = self.ledger.update_result(&ctx.job.id, ctx.report.to_value()) {
            warn!(job_id = %ctx.job.id, "Failed to record change progress: {}", e);
        }
    }

    fn fail(&self, ctx: &mut RunContext<'_>, kind: FailureKind, error: String) -> JobOutcome {
        warn!(job_id = %ctx.job.id, device_id = %ctx.device.id, failure = %kind, "{}", error);
        ctx.report.record(ChangePhase::Failed, Some(error.clone()));
        JobOutcome::failed(kind, error, ctx.report.to_value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{CreateJobRequest, JobKind, JobStatus, SqliteJobLedger};
    use crate::snapshot::SqliteSnapshotStore;
    use crate::testing::{fixtures, FakeTransport};
    use tempfile::TempDir;

    struct Harness {
        engine: Arc<CommitConfirmEngine>,
        transport: Arc<FakeTransport>,
        snapshots: Arc<SqliteSnapshotStore>,
        ledger: Arc<SqliteJobLedger>,
        device: Device,
        _dir: TempDir,
    }

    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let device = fixtures::device("42");
        let transport = Arc::new(FakeTransport::new().with_device("42", fixtures::BASE_CONFIG));
        let snapshots = Arc::new(SqliteSnapshotStore::in_memory(dir.path().join("repo")).unwrap());
        let ledger = Arc::new(SqliteJobLedger::in_memory().unwrap());
        let engine = Arc::new(CommitConfirmEngine::new(
            CommitConfirmConfig::default(),
            transport.clone(),
            snapshots.clone(),
            ledger.clone(),
            None,
        ));
        Harness {
            engine,
            transport,
            snapshots,
            ledger,
            device,
            _dir: dir,
        }
    }

    fn start_job(h: &Harness) -> Job {
        let job = h
            .ledger
            .create(CreateJobRequest::new("42", JobKind::ApplyChange))
            .unwrap();
        h.ledger.start(&job.id).unwrap()
    }

    fn spawn_run(h: &Harness, job: &Job, request: ChangeRequest) -> tokio::task::JoinHandle<JobOutcome> {
        let engine = h.engine.clone();
        let job = job.clone();
        let device = h.device.clone();
        tokio::spawn(async move { engine.run(&job, &device, &request).await })
    }

    fn three_commands() -> Vec<String> {
        vec![
            "set system ntp server 10.0.0.2".to_string(),
            "set interfaces ge-0/0/1 description uplink".to_string(),
            "set snmp community monitor".to_string(),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_within_window_succeeds() {
        let h = harness();
        let job = start_job(&h);
        let run = spawn_run(&h, &job, ChangeRequest::new(three_commands(), "ntp + snmp"));

        fixtures::wait_for_window(h.engine.registry(), &job.id).await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        h.engine.confirm(&job.id).unwrap();

        let outcome = run.await.unwrap();
        assert_eq!(outcome.status, JobStatus::Success);
        let report: ChangeReport = serde_json::from_value(outcome.result).unwrap();
        assert!(report.confirmed);
        assert_eq!(report.confirmed_by, Some(ConfirmationSource::Operator));

        let pre = report.pre_snapshot_id.unwrap();
        let post = report.post_snapshot_id.unwrap();
        assert_ne!(pre, post);
        assert_ne!(
            h.snapshots.retrieve(&pre).unwrap(),
            h.snapshots.retrieve(&post).unwrap()
        );
        assert!(report
            .diff
            .unwrap()
            .contains("+set system ntp server 10.0.0.2"));
        // Confirmed commits stay after the window would have expired.
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(h
            .transport
            .running_config("42")
            .contains("set snmp community monitor"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_window_rolls_back() {
        let h = harness();
        let job = start_job(&h);
        let request = ChangeRequest::new(three_commands(), "never confirmed").with_timeout_secs(1);

        let outcome = spawn_run(&h, &job, request).await.unwrap();
        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.failure, Some(FailureKind::RollbackOccurred));
        assert!(!outcome.needs_attention);

        let report: ChangeReport = serde_json::from_value(outcome.result).unwrap();
        assert!(!report.confirmed);
        assert!(report.confirmed_by.is_none());
        assert!(report.discrepancy.is_none());
        assert_eq!(
            h.snapshots
                .retrieve(report.pre_snapshot_id.as_deref().unwrap())
                .unwrap(),
            h.snapshots
                .retrieve(report.post_snapshot_id.as_deref().unwrap())
                .unwrap()
        );
        assert!(!h.engine.registry().is_open(&job.id));
        assert!(h.engine.confirm(&job.id).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_syntax_error_takes_no_snapshots() {
        let h = harness();
        h.transport
            .set_syntax_error("42", Some("unknown keyword 'sett'"));
        let job = start_job(&h);

        let outcome = spawn_run(&h, &job, ChangeRequest::new(vec!["sett foo".into()], "typo"))
            .await
            .unwrap();
        assert_eq!(outcome.failure, Some(FailureKind::ValidationError));
        assert!(outcome.error.unwrap().contains("sett"));
        assert_eq!(h.snapshots.count("42").unwrap(), 0);
        assert_eq!(h.transport.call_count("commit"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_change_takes_both_snapshots() {
        let h = harness();
        let job = start_job(&h);

        let outcome = spawn_run(&h, &job, ChangeRequest::new(vec![], "noop"))
            .await
            .unwrap();
        assert_eq!(outcome.status, JobStatus::Success);
        assert_eq!(h.snapshots.count("42").unwrap(), 2);
        assert_eq!(outcome.result["summary"], "no changes");
        assert_eq!(h.transport.call_count("commit"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_confirm() {
        let h = harness();
        let job = start_job(&h);
        let request = ChangeRequest::new(three_commands(), "auto").with_auto_confirm();

        let outcome = spawn_run(&h, &job, request).await.unwrap();
        assert_eq!(outcome.status, JobStatus::Success);
        assert_eq!(outcome.result["confirmed_by"], "auto");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_past_ceiling_needs_attention() {
        let h = harness();
        h.transport.dark_after_commit("42", Duration::from_secs(3600));
        let job = start_job(&h);
        let request = ChangeRequest::new(three_commands(), "lost").with_timeout_secs(60);

        let outcome = spawn_run(&h, &job, request).await.unwrap();
        assert_eq!(outcome.failure, Some(FailureKind::UnreachableError));
        assert!(outcome.needs_attention);
        // Only the pre-change snapshot exists.
        assert_eq!(h.snapshots.count("42").unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_brief_outage_then_rollback_verified() {
        let h = harness();
        h.transport.dark_after_commit("42", Duration::from_secs(90));
        let job = start_job(&h);
        let request = ChangeRequest::new(three_commands(), "flap").with_timeout_secs(60);

        let outcome = spawn_run(&h, &job, request).await.unwrap();
        assert_eq!(outcome.failure, Some(FailureKind::RollbackOccurred));
        let report: ChangeReport = serde_json::from_value(outcome.result).unwrap();
        assert!(report
            .phases
            .iter()
            .any(|p| p.phase == ChangePhase::ReachabilityLost));
        assert!(report.post_snapshot_id.is_some());
        assert!(report.discrepancy.is_none());
    }

    #[tokio::test]
    async fn test_timeout_out_of_range() {
        let h = harness();
        assert!(h.engine.resolve_timeout(None).is_ok());
        assert_eq!(
            h.engine.resolve_timeout(Some(0)),
            Err(ChangeError::TimeoutOutOfRange {
                requested: 0,
                min: 1,
                max: 3600
            })
        );

        let job = start_job(&h);
        let request = ChangeRequest::new(three_commands(), "huge").with_timeout_secs(90_000);
        let outcome = h.engine.run(&job, &h.device, &request).await;
        assert_eq!(outcome.failure, Some(FailureKind::ValidationError));
        assert_eq!(h.transport.call_count("connect"), 0);
    }
}
