//! Task dispatcher implementation.
//!
//! Turns trigger requests into jobs and runs them:
//! - Creation: the device lock is taken together with the job row, so a busy
//!   device rejects the trigger immediately.
//! - Execution: each job runs on its own task once it holds a worker slot,
//!   routed to the backup routine, the commit-confirm engine or the upgrade
//!   orchestrator.
//! - Scheduling: an optional loop triggers fleet-wide backups.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{broadcast, Semaphore};
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEvent, AuditHandle};
use crate::change::{ChangeError, ChangeRequest, CommitConfirmConfig, CommitConfirmEngine};
use crate::device::{Device, DeviceDirectory, DeviceTransport};
use crate::ledger::{
    CreateJobRequest, DeviceLock, Job, JobFilter, JobKind, JobLedger, JobOutcome, JobStats,
    JobStatus, LedgerError,
};
use crate::metrics;
use crate::snapshot::{Snapshot, SnapshotStore, SnapshotTrigger};
use crate::upgrade::{
    FirmwareImage, ReadinessReport, UpgradeConfig, UpgradeOrchestrator, UpgradePlan,
    UpgradeRequest,
};

use super::backup::run_backup;
use super::config::DispatcherConfig;
use super::dedupe::{fingerprint, RecentTriggers};
use super::guard::JobGuard;
use super::types::{DispatchError, DispatcherStatus, FleetBackupEntry};

/// What a queued job will do once it gets a worker.
enum Work {
    Backup(SnapshotTrigger),
    Change(ChangeRequest),
    Upgrade(UpgradeRequest),
}

impl Work {
    fn kind(&self) -> JobKind {
        match self {
            Work::Backup(_) => JobKind::Backup,
            Work::Change(_) => JobKind::ApplyChange,
            Work::Upgrade(_) => JobKind::Upgrade,
        }
    }

    fn params(&self) -> serde_json::Value {
        match self {
            Work::Backup(trigger) => serde_json::json!({ "trigger": trigger.as_str() }),
            Work::Change(request) => serde_json::to_value(request).unwrap_or_default(),
            Work::Upgrade(request) => serde_json::to_value(request).unwrap_or_default(),
        }
    }
}

/// State shared between the dispatcher handle and its job tasks.
struct Shared {
    config: DispatcherConfig,
    ledger: Arc<dyn JobLedger>,
    snapshots: Arc<dyn SnapshotStore>,
    devices: Arc<dyn DeviceDirectory>,
    transport: Arc<dyn DeviceTransport>,
    change: CommitConfirmEngine,
    upgrade: UpgradeOrchestrator,
    audit: AuditHandle,
    workers: Arc<Semaphore>,
    recent: Mutex<RecentTriggers>,
}

impl Shared {
    fn device(&self, device_id: &str) -> Result<Device, DispatchError> {
        let device = self
            .devices
            .get(device_id)
            .ok_or_else(|| DispatchError::DeviceNotFound(device_id.to_string()))?;
        if !device.enabled {
            return Err(DispatchError::DeviceDisabled(device_id.to_string()));
        }
        Ok(device)
    }

    /// Record a refused trigger and hand the error back.
    async fn reject(&self, device_id: &str, kind: JobKind, err: DispatchError) -> DispatchError {
        metrics::TRIGGER_REJECTIONS
            .with_label_values(&[err.reason()])
            .inc();
        info!(device_id = %device_id, kind = %kind, "Trigger rejected: {}", err);
        self.audit
            .emit(AuditEvent::TriggerRejected {
                device_id: device_id.to_string(),
                kind: kind.as_str().to_string(),
                reason: err.to_string(),
            })
            .await;
        err
    }

    async fn resolve(&self, device_id: &str, kind: JobKind) -> Result<Device, DispatchError> {
        match self.device(device_id) {
            Ok(device) => Ok(device),
            Err(e) => Err(self.reject(device_id, kind, e).await),
        }
    }

    /// Create the job (taking the device lock) and spawn its task.
    async fn enqueue(
        self: &Arc<Self>,
        device: Device,
        work: Work,
        requested_by: &str,
    ) -> Result<Job, DispatchError> {
        let kind = work.kind();
        let params = work.params();
        let fingerprint = fingerprint(&params);

        let duplicate = self
            .recent
            .lock()
            .unwrap()
            .duplicate_of(&device.id, kind, &fingerprint);
        if let Some(job_id) = duplicate {
            return Err(self
                .reject(&device.id, kind, DispatchError::Duplicate { job_id })
                .await);
        }

        let request = CreateJobRequest::new(&device.id, kind)
            .requested_by(requested_by)
            .with_params(params);
        let job = match self.ledger.create(request) {
            Ok(job) => job,
            Err(LedgerError::DeviceLocked { device_id, holder }) => {
                return Err(self
                    .reject(
                        &device.id,
                        kind,
                        DispatchError::DeviceLocked { device_id, holder },
                    )
                    .await)
            }
            Err(e) => return Err(e.into()),
        };

        metrics::JOBS_CREATED
            .with_label_values(&[kind.as_str()])
            .inc();
        info!(
            job_id = %job.id,
            device_id = %job.device_id,
            kind = %kind,
            requested_by = %requested_by,
            "Job created"
        );
        self.audit
            .emit(AuditEvent::JobCreated {
                job_id: job.id.clone(),
                device_id: job.device_id.clone(),
                kind: kind.as_str().to_string(),
                requested_by: requested_by.to_string(),
            })
            .await;

        let shared = Arc::clone(self);
        let queued = job.clone();
        tokio::spawn(async move { shared.run_job(queued, device, work, fingerprint).await });
        Ok(job)
    }

    async fn run_job(self: Arc<Self>, job: Job, device: Device, work: Work, fingerprint: String) {
        let mut guard = JobGuard::new(Arc::clone(&self.ledger), job.id.clone());
        let _permit = match Arc::clone(&self.workers).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!(job_id = %job.id, "Worker pool closed before the job started");
                return;
            }
        };

        let job = match self.ledger.start(&job.id) {
            Ok(job) => job,
            Err(LedgerError::InvalidTransition { from, .. }) => {
                debug!(job_id = %job.id, status = %from, "Job left pending before it started");
                guard.disarm();
                return;
            }
            Err(e) => {
                error!(job_id = %job.id, "Failed to start job: {}", e);
                return;
            }
        };
        guard.started();
        debug!(job_id = %job.id, device_id = %job.device_id, kind = %job.kind, "Job running");
        self.audit
            .emit(AuditEvent::JobStateChanged {
                job_id: job.id.clone(),
                device_id: job.device_id.clone(),
                from_state: JobStatus::Pending.as_str().to_string(),
                to_state: JobStatus::Running.as_str().to_string(),
                failure: None,
                error: None,
                needs_attention: false,
            })
            .await;

        let started = Instant::now();
        let outcome = match &work {
            Work::Backup(trigger) => {
                run_backup(
                    self.transport.as_ref(),
                    self.snapshots.as_ref(),
                    &self.audit,
                    &job,
                    &device,
                    *trigger,
                )
                .await
            }
            Work::Change(request) => self.change.run(&job, &device, request).await,
            Work::Upgrade(request) => {
                self.upgrade
                    .run(&job, &device, &request.target_version)
                    .await
            }
        };

        if self.finish(&job, outcome, fingerprint, started).await {
            guard.disarm();
        }
    }

    /// Write the terminal state. Returns false if the ledger refused it.
    async fn finish(
        &self,
        job: &Job,
        outcome: JobOutcome,
        fingerprint: String,
        started: Instant,
    ) -> bool {
        // Before the lock is released by the terminal transition.
        self.recent
            .lock()
            .unwrap()
            .record(&job.device_id, job.kind, fingerprint, &job.id);

        let done = match self.ledger.complete(&job.id, outcome) {
            Ok(done) => done,
            Err(e) => {
                error!(job_id = %job.id, "Failed to record job outcome: {}", e);
                return false;
            }
        };

        let failure = done.failure.map(|f| f.as_str()).unwrap_or("none");
        metrics::JOBS_FINISHED
            .with_label_values(&[done.kind.as_str(), done.status.as_str(), failure])
            .inc();
        metrics::JOB_DURATION
            .with_label_values(&[done.kind.as_str()])
            .observe(started.elapsed().as_secs_f64());

        match (done.status, done.needs_attention) {
            (JobStatus::Success, _) => info!(
                job_id = %done.id,
                device_id = %done.device_id,
                kind = %done.kind,
                "Job succeeded"
            ),
            (_, true) => error!(
                job_id = %done.id,
                device_id = %done.device_id,
                kind = %done.kind,
                failure = %failure,
                "Job failed and needs attention: {}",
                done.error.as_deref().unwrap_or("")
            ),
            _ => warn!(
                job_id = %done.id,
                device_id = %done.device_id,
                kind = %done.kind,
                failure = %failure,
                "Job failed: {}",
                done.error.as_deref().unwrap_or("")
            ),
        }

        self.audit
            .emit(AuditEvent::JobStateChanged {
                job_id: done.id.clone(),
                device_id: done.device_id.clone(),
                from_state: JobStatus::Running.as_str().to_string(),
                to_state: done.status.as_str().to_string(),
                failure: done.failure.map(|f| f.as_str().to_string()),
                error: done.error.clone(),
                needs_attention: done.needs_attention,
            })
            .await;
        true
    }

    async fn backup_fleet(
        self: &Arc<Self>,
        devices: Vec<Device>,
        requested_by: &str,
        trigger: SnapshotTrigger,
    ) -> Vec<FleetBackupEntry> {
        let jobs = devices.into_iter().filter(|d| d.enabled).map(|device| async move {
            let device_id = device.id.clone();
            match self.enqueue(device, Work::Backup(trigger), requested_by).await {
                Ok(job) => FleetBackupEntry {
                    device_id,
                    job_id: Some(job.id),
                    rejected: None,
                },
                Err(e) => FleetBackupEntry {
                    device_id,
                    job_id: None,
                    rejected: Some(e.to_string()),
                },
            }
        });
        join_all(jobs).await
    }
}

/// The task dispatcher: entry point for every orchestration request.
pub struct TaskDispatcher {
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl TaskDispatcher {
    /// Create a new dispatcher and the engines it routes to.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DispatcherConfig,
        ledger: Arc<dyn JobLedger>,
        snapshots: Arc<dyn SnapshotStore>,
        devices: Arc<dyn DeviceDirectory>,
        transport: Arc<dyn DeviceTransport>,
        commit_confirm: CommitConfirmConfig,
        upgrade: UpgradeConfig,
        audit: Option<AuditHandle>,
    ) -> Self {
        let audit = audit.unwrap_or_else(AuditHandle::disabled);
        let (shutdown_tx, _) = broadcast::channel(1);

        let change = CommitConfirmEngine::new(
            commit_confirm,
            Arc::clone(&transport),
            Arc::clone(&snapshots),
            Arc::clone(&ledger),
            Some(audit.clone()),
        );
        let upgrade = UpgradeOrchestrator::new(
            upgrade,
            Arc::clone(&transport),
            Arc::clone(&snapshots),
            Arc::clone(&ledger),
            Some(audit.clone()),
        );

        Self {
            shared: Arc::new(Shared {
                workers: Arc::new(Semaphore::new(config.max_workers.max(1))),
                recent: Mutex::new(RecentTriggers::new(config.dedupe_window())),
                config,
                ledger,
                snapshots,
                devices,
                transport,
                change,
                upgrade,
                audit,
            }),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn JobLedger> {
        &self.shared.ledger
    }

    pub fn snapshots(&self) -> &Arc<dyn SnapshotStore> {
        &self.shared.snapshots
    }

    pub fn devices(&self) -> &Arc<dyn DeviceDirectory> {
        &self.shared.devices
    }

    pub fn change_engine(&self) -> &CommitConfirmEngine {
        &self.shared.change
    }

    pub fn upgrade_orchestrator(&self) -> &UpgradeOrchestrator {
        &self.shared.upgrade
    }

    /// Start background work (the scheduled backup loop, when enabled).
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Dispatcher already running");
            return;
        }

        info!(
            max_workers = self.shared.config.max_workers,
            scheduled_backup = self.shared.config.scheduled_backup.enabled,
            "Starting task dispatcher"
        );
        if self.shared.config.scheduled_backup.enabled {
            self.spawn_backup_loop();
        }
    }

    /// Stop background work. Jobs already running finish on their own.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Dispatcher not running");
            return;
        }

        info!("Stopping task dispatcher");
        let _ = self.shutdown_tx.send(());
    }

    pub fn status(&self) -> DispatcherStatus {
        DispatcherStatus {
            running: self.running.load(Ordering::Relaxed),
            max_workers: self.shared.config.max_workers,
            idle_workers: self.shared.workers.available_permits(),
            open_confirm_windows: self.shared.change.registry().open_windows(),
        }
    }

    fn spawn_backup_loop(&self) {
        let shared = Arc::clone(&self.shared);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let period = Duration::from_secs(shared.config.scheduled_backup.interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Scheduled backup loop shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let devices = shared.devices.list();
                        let entries = shared
                            .backup_fleet(devices, "system", SnapshotTrigger::Scheduled)
                            .await;
                        let queued = entries.iter().filter(|e| e.job_id.is_some()).count();
                        info!(
                            queued,
                            skipped = entries.len() - queued,
                            "Scheduled backup triggered"
                        );
                    }
                }
            }
        });
    }

    /// Fail jobs a previous process left unfinished and free their locks.
    pub async fn recover_interrupted(&self) -> Result<Vec<Job>, DispatchError> {
        let recovered = self.shared.ledger.recover()?;
        if !recovered.is_empty() {
            warn!(count = recovered.len(), "Failed jobs interrupted by restart");
            self.shared
                .audit
                .emit(AuditEvent::JobsRecovered {
                    job_ids: recovered.iter().map(|j| j.id.clone()).collect(),
                })
                .await;
        }
        Ok(recovered)
    }

    // =========================================================================
    // Triggers
    // =========================================================================

    pub async fn trigger_backup(&self, device_id: &str, requested_by: &str) -> Result<Job, DispatchError> {
        let device = self.shared.resolve(device_id, JobKind::Backup).await?;
        self.shared
            .enqueue(device, Work::Backup(SnapshotTrigger::Manual), requested_by)
            .await
    }

    pub async fn trigger_apply_change(
        &self,
        device_id: &str,
        request: ChangeRequest,
        requested_by: &str,
    ) -> Result<Job, DispatchError> {
        let device = self.shared.resolve(device_id, JobKind::ApplyChange).await?;
        if let Err(e) = self.shared.change.resolve_timeout(request.timeout_secs) {
            return Err(self
                .shared
                .reject(device_id, JobKind::ApplyChange, e.into())
                .await);
        }
        self.shared
            .enqueue(device, Work::Change(request), requested_by)
            .await
    }

    pub async fn check_upgrade_readiness(
        &self,
        device_id: &str,
        target_version: &str,
    ) -> Result<ReadinessReport, DispatchError> {
        let device = self.shared.device(device_id)?;
        Ok(self
            .shared
            .upgrade
            .check_readiness(&device, target_version)
            .await?)
    }

    pub async fn generate_upgrade_plan(
        &self,
        device_id: &str,
        target_version: &str,
    ) -> Result<UpgradePlan, DispatchError> {
        let device = self.shared.device(device_id)?;
        Ok(self
            .shared
            .upgrade
            .generate_plan(&device, target_version)
            .await?)
    }

    /// Start an upgrade. Requires a fresh readiness check for the same
    /// target that found the device ready; otherwise no job is created.
    pub async fn initiate_upgrade(
        &self,
        device_id: &str,
        target_version: &str,
        requested_by: &str,
    ) -> Result<Job, DispatchError> {
        let device = self.shared.resolve(device_id, JobKind::Upgrade).await?;

        let reason = match self.shared.upgrade.cached_readiness(device_id, target_version) {
            Some(report) if report.ready => None,
            Some(report) => Some(if report.prerequisites.is_empty() {
                report.warnings.join("; ")
            } else {
                report.prerequisites.join("; ")
            }),
            None => Some(format!(
                "no current readiness check for {}",
                target_version
            )),
        };
        if let Some(reason) = reason {
            let err = DispatchError::UpgradeNotReady {
                device_id: device_id.to_string(),
                reason,
            };
            return Err(self.shared.reject(device_id, JobKind::Upgrade, err).await);
        }

        let request = UpgradeRequest {
            target_version: target_version.to_string(),
        };
        self.shared
            .enqueue(device, Work::Upgrade(request), requested_by)
            .await
    }

    /// Back up every enabled device.
    pub async fn backup_all(&self, requested_by: &str) -> Vec<FleetBackupEntry> {
        let devices = self.shared.devices.list();
        self.shared
            .backup_fleet(devices, requested_by, SnapshotTrigger::Manual)
            .await
    }

    /// Back up every enabled device in `region`.
    pub async fn backup_region(&self, region: &str, requested_by: &str) -> Vec<FleetBackupEntry> {
        let devices = self.shared.devices.in_region(region);
        self.shared
            .backup_fleet(devices, requested_by, SnapshotTrigger::Manual)
            .await
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    pub fn get_job(&self, job_id: &str) -> Result<Job, DispatchError> {
        self.shared
            .ledger
            .get(job_id)?
            .ok_or_else(|| DispatchError::JobNotFound(job_id.to_string()))
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, DispatchError> {
        Ok(self.shared.ledger.list(filter)?)
    }

    pub fn count_jobs(&self, filter: &JobFilter) -> Result<i64, DispatchError> {
        Ok(self.shared.ledger.count(filter)?)
    }

    pub fn job_stats(&self) -> Result<JobStats, DispatchError> {
        Ok(self.shared.ledger.stats()?)
    }

    /// Cancel a job that has not started yet.
    pub async fn cancel(&self, job_id: &str, cancelled_by: &str) -> Result<Job, DispatchError> {
        let job = self.get_job(job_id)?;
        if job.status != JobStatus::Pending {
            return Err(DispatchError::NotPending {
                job_id: job.id,
                status: job.status,
            });
        }

        let job = match self.shared.ledger.cancel(job_id) {
            Ok(job) => job,
            Err(LedgerError::InvalidTransition { from, .. }) => {
                return Err(DispatchError::NotPending {
                    job_id: job_id.to_string(),
                    status: from,
                })
            }
            Err(e) => return Err(e.into()),
        };

        metrics::JOBS_FINISHED
            .with_label_values(&[job.kind.as_str(), job.status.as_str(), "none"])
            .inc();
        info!(job_id = %job.id, device_id = %job.device_id, cancelled_by = %cancelled_by, "Job cancelled");
        self.shared
            .audit
            .emit(AuditEvent::JobCancelled {
                job_id: job.id.clone(),
                device_id: job.device_id.clone(),
                cancelled_by: cancelled_by.to_string(),
            })
            .await;
        Ok(job)
    }

    /// Confirm the open commit-confirm window of an apply-change job.
    pub fn confirm(&self, job_id: &str) -> Result<(), DispatchError> {
        self.get_job(job_id)?;
        self.shared.change.confirm(job_id).map_err(|e| match e {
            ChangeError::NotAwaitingConfirmation(id) => DispatchError::NotAwaitingConfirmation(id),
            other => other.into(),
        })
    }

    /// Operator release of a lock whose holder already terminated.
    pub async fn release_lock(
        &self,
        device_id: &str,
        released_by: &str,
    ) -> Result<Option<DeviceLock>, DispatchError> {
        let released = self.shared.ledger.release_lock(device_id)?;
        if let Some(lock) = &released {
            warn!(
                device_id = %device_id,
                job_id = %lock.job_id,
                released_by = %released_by,
                "Device lock released by operator"
            );
            self.shared
                .audit
                .emit(AuditEvent::LockReleased {
                    device_id: device_id.to_string(),
                    job_id: lock.job_id.clone(),
                    released_by: released_by.to_string(),
                })
                .await;
        }
        Ok(released)
    }

    // =========================================================================
    // Snapshots and firmware
    // =========================================================================

    /// Device history, most recent first.
    pub fn list_snapshots(
        &self,
        device_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Snapshot>, DispatchError> {
        Ok(self.shared.snapshots.history(device_id, limit, offset)?)
    }

    pub fn get_snapshot(&self, snapshot_id: &str) -> Result<Snapshot, DispatchError> {
        self.shared
            .snapshots
            .get(snapshot_id)?
            .ok_or_else(|| crate::snapshot::SnapshotError::NotFound(snapshot_id.to_string()).into())
    }

    pub fn get_snapshot_content(&self, snapshot_id: &str) -> Result<String, DispatchError> {
        Ok(self.shared.snapshots.retrieve(snapshot_id)?)
    }

    pub fn diff_snapshots(&self, from_id: &str, to_id: &str) -> Result<String, DispatchError> {
        Ok(self.shared.snapshots.diff(from_id, to_id)?)
    }

    pub fn list_firmware(&self) -> Result<Vec<FirmwareImage>, DispatchError> {
        Ok(self.shared.upgrade.catalog().list()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::StaticDeviceDirectory;
    use crate::ledger::{FailureKind, SqliteJobLedger};
    use crate::snapshot::SqliteSnapshotStore;
    use crate::testing::{fixtures, FakeTransport};
    use tempfile::TempDir;

    struct Harness {
        dispatcher: TaskDispatcher,
        transport: Arc<FakeTransport>,
        _dir: TempDir,
    }

    fn harness(max_workers: usize) -> Harness {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(
            FakeTransport::new()
                .with_device("42", fixtures::BASE_CONFIG)
                .with_device("43", fixtures::BASE_CONFIG),
        );
        let devices = StaticDeviceDirectory::new(vec![
            fixtures::device("42"),
            fixtures::device("43"),
            fixtures::device("44").disabled(),
        ]);
        let dispatcher = TaskDispatcher::new(
            DispatcherConfig {
                max_workers,
                ..Default::default()
            },
            Arc::new(SqliteJobLedger::in_memory().unwrap()),
            Arc::new(SqliteSnapshotStore::in_memory(dir.path().join("repo")).unwrap()),
            Arc::new(devices),
            transport.clone(),
            CommitConfirmConfig::default(),
            UpgradeConfig {
                firmware_dir: dir.path().join("firmware"),
                ..Default::default()
            },
            None,
        );
        Harness {
            dispatcher,
            transport,
            _dir: dir,
        }
    }

    async fn wait(h: &Harness, job_id: &str) -> Job {
        fixtures::wait_for_terminal(h.dispatcher.ledger().as_ref(), job_id).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_backup_runs_to_success() {
        let h = harness(5);
        let job = h.dispatcher.trigger_backup("42", "alice").await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.requested_by, "alice");
        assert_eq!(job.params["trigger"], "manual");

        let done = wait(&h, &job.id).await;
        assert_eq!(done.status, JobStatus::Success);
        assert_eq!(h.dispatcher.list_snapshots("42", 10, 0).unwrap().len(), 1);
        assert!(h.dispatcher.ledger().lock_holder("42").unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_and_disabled_devices() {
        let h = harness(5);
        assert!(matches!(
            h.dispatcher.trigger_backup("99", "alice").await,
            Err(DispatchError::DeviceNotFound(_))
        ));
        assert!(matches!(
            h.dispatcher.trigger_backup("44", "alice").await,
            Err(DispatchError::DeviceDisabled(_))
        ));
        assert_eq!(h.dispatcher.job_stats().unwrap().total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_trigger_after_finish_is_duplicate() {
        let h = harness(5);
        let first = h.dispatcher.trigger_backup("42", "alice").await.unwrap();
        wait(&h, &first.id).await;

        match h.dispatcher.trigger_backup("42", "alice").await {
            Err(DispatchError::Duplicate { job_id }) => assert_eq!(job_id, first.id),
            other => panic!("expected duplicate, got {:?}", other),
        }

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(h.dispatcher.trigger_backup("42", "alice").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_pending_job_waiting_for_worker() {
        let h = harness(1);
        let change = h
            .dispatcher
            .trigger_apply_change(
                "42",
                ChangeRequest::new(vec!["set snmp community monitor".into()], "snmp"),
                "alice",
            )
            .await
            .unwrap();
        fixtures::wait_for_window(h.dispatcher.change_engine().registry(), &change.id).await;

        // The only worker is busy inside the confirm window.
        let backup = h.dispatcher.trigger_backup("43", "bob").await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.dispatcher.get_job(&backup.id).unwrap().status, JobStatus::Pending);

        let cancelled = h.dispatcher.cancel(&backup.id, "bob").await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(h.dispatcher.ledger().lock_holder("43").unwrap().is_none());

        h.dispatcher.confirm(&change.id).unwrap();
        assert_eq!(wait(&h, &change.id).await.status, JobStatus::Success);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.dispatcher.get_job(&backup.id).unwrap().status, JobStatus::Cancelled);
        assert!(h.transport.calls().iter().all(|c| !c.ends_with(":43")));

        assert!(matches!(
            h.dispatcher.cancel(&change.id, "bob").await,
            Err(DispatchError::NotPending { .. })
        ));
        assert!(matches!(
            h.dispatcher.confirm(&change.id),
            Err(DispatchError::NotAwaitingConfirmation(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_timeout_rejected_before_job() {
        let h = harness(5);
        let request = ChangeRequest::new(vec!["set a".into()], "x").with_timeout_secs(0);
        assert!(matches!(
            h.dispatcher.trigger_apply_change("42", request, "alice").await,
            Err(DispatchError::Change(ChangeError::TimeoutOutOfRange { .. }))
        ));
        assert_eq!(h.dispatcher.job_stats().unwrap().total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upgrade_without_readiness_creates_no_job() {
        let h = harness(5);
        assert!(matches!(
            h.dispatcher.initiate_upgrade("42", "21.4R3", "alice").await,
            Err(DispatchError::UpgradeNotReady { .. })
        ));
        assert_eq!(h.dispatcher.job_stats().unwrap().total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backup_region_skips_disabled() {
        let h = harness(5);
        let entries = h.dispatcher.backup_region("emea", "alice").await;
        let ids: Vec<_> = entries.iter().map(|e| e.device_id.as_str()).collect();
        assert_eq!(ids, vec!["42", "43"]);
        for entry in &entries {
            let job = wait(&h, entry.job_id.as_deref().unwrap()).await;
            assert_eq!(job.status, JobStatus::Success);
        }
        assert!(h.dispatcher.backup_region("apac", "alice").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_backup_loop() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport::new().with_device("42", fixtures::BASE_CONFIG));
        let ledger = Arc::new(SqliteJobLedger::in_memory().unwrap());
        let dispatcher = TaskDispatcher::new(
            DispatcherConfig {
                scheduled_backup: crate::dispatcher::ScheduledBackupConfig {
                    enabled: true,
                    interval_secs: 3600,
                },
                ..Default::default()
            },
            ledger.clone(),
            Arc::new(SqliteSnapshotStore::in_memory(dir.path().join("repo")).unwrap()),
            Arc::new(StaticDeviceDirectory::new(vec![fixtures::device("42")])),
            transport,
            CommitConfirmConfig::default(),
            UpgradeConfig::default(),
            None,
        );

        dispatcher.start().await;
        tokio::time::sleep(Duration::from_secs(3601)).await;
        let jobs = dispatcher.list_jobs(&JobFilter::new()).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].requested_by, "system");
        assert_eq!(jobs[0].params["trigger"], "scheduled");

        dispatcher.stop().await;
        tokio::time::sleep(Duration::from_secs(7200)).await;
        assert_eq!(dispatcher.list_jobs(&JobFilter::new()).unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_interrupted_jobs() {
        let h = harness(5);
        let orphan = h
            .dispatcher
            .ledger()
            .create(CreateJobRequest::new("43", JobKind::Upgrade))
            .unwrap();
        h.dispatcher.ledger().start(&orphan.id).unwrap();

        let recovered = h.dispatcher.recover_interrupted().await.unwrap();
        assert_eq!(recovered.len(), 1);
        let job = h.dispatcher.get_job(&orphan.id).unwrap();
        assert_eq!(job.failure, Some(FailureKind::Internal));
        assert!(job.needs_attention);
    }
}
