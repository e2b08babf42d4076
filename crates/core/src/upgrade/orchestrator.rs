//! Firmware upgrade orchestration.
//!
//! Readiness checks and plans are read-only. Execution runs the phases in
//! order and never retries a step that changed the device; the only loop is
//! the bounded wait for the device to come back from its reboot.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditHandle};
use crate::device::{reconnect_until, Device, DeviceSession, DeviceTransport, ImageTransfer};
use crate::ledger::{FailureKind, Job, JobLedger, JobOutcome};
use crate::metrics;
use crate::snapshot::{capture_snapshot, SnapshotRequest, SnapshotStore, SnapshotTrigger};

use super::config::UpgradeConfig;
use super::firmware::FirmwareCatalog;
use super::plan::build_plan;
use super::readiness::{assess, ReadinessCache, ReadinessInput};
use super::types::{
    PhaseStatus, ReadinessReport, UpgradeError, UpgradeOutcome, UpgradePhase, UpgradePlan,
    UpgradeReport,
};

struct RunContext<'a> {
    job: &'a Job,
    device: &'a Device,
    report: UpgradeReport,
    /// Set once the install step has touched the device.
    mutated: bool,
}

pub struct UpgradeOrchestrator {
    config: UpgradeConfig,
    catalog: FirmwareCatalog,
    readiness: ReadinessCache,
    transport: Arc<dyn DeviceTransport>,
    snapshots: Arc<dyn SnapshotStore>,
    ledger: Arc<dyn JobLedger>,
    audit: AuditHandle,
}

impl UpgradeOrchestrator {
    pub fn new(
        config: UpgradeConfig,
        transport: Arc<dyn DeviceTransport>,
        snapshots: Arc<dyn SnapshotStore>,
        ledger: Arc<dyn JobLedger>,
        audit: Option<AuditHandle>,
    ) -> Self {
        Self {
            catalog: FirmwareCatalog::new(config.firmware_dir.clone()),
            readiness: ReadinessCache::new(Duration::from_secs(config.readiness_ttl_secs)),
            config,
            transport,
            snapshots,
            ledger,
            audit: audit.unwrap_or_else(AuditHandle::disabled),
        }
    }

    pub fn config(&self) -> &UpgradeConfig {
        &self.config
    }

    pub fn catalog(&self) -> &FirmwareCatalog {
        &self.catalog
    }

    /// Gather facts, assess, and cache the report for later initiation.
    pub async fn check_readiness(
        &self,
        device: &Device,
        target_version: &str,
    ) -> Result<ReadinessReport, UpgradeError> {
        let image = self.catalog.find(target_version)?;
        let mut input = ReadinessInput {
            device_id: device.id.clone(),
            target_version: target_version.to_string(),
            reachable: self.transport.reachable(device).await,
            facts: None,
            storage: None,
            config_bytes: None,
            image,
        };

        if input.reachable {
            match self.transport.connect(device).await {
                Ok(session) => {
                    input.facts = self.transport.get_facts(&session).await.ok();
                    input.storage = match self.transport.get_storage(&session).await {
                        Ok(storage) => Some(storage),
                        Err(e) => {
                            warn!(device_id = %device.id, "Readiness check could not read storage: {}", e);
                            None
                        }
                    };
                    input.config_bytes = self
                        .transport
                        .fetch_config(&session)
                        .await
                        .ok()
                        .map(|c| c.len() as u64);
                    let _ = self.transport.disconnect(&session).await;
                    if input.facts.is_none() {
                        input.reachable = false;
                    }
                }
                Err(e) => {
                    warn!(device_id = %device.id, "Readiness check could not connect: {}", e);
                    input.reachable = false;
                }
            }
        }

        let report = assess(&input, &self.config);
        info!(
            device_id = %device.id,
            target = %target_version,
            ready = report.ready,
            risk = report.risk.as_str(),
            "Upgrade readiness checked"
        );
        self.audit
            .emit(AuditEvent::UpgradeReadinessChecked {
                device_id: device.id.clone(),
                target_version: target_version.to_string(),
                ready: report.ready,
                risk: report.risk.as_str().to_string(),
            })
            .await;
        self.readiness.store(report.clone());
        Ok(report)
    }

    /// A cached, unexpired readiness report for exactly this target.
    pub fn cached_readiness(&self, device_id: &str, target_version: &str) -> Option<ReadinessReport> {
        self.readiness.get(device_id, target_version)
    }

    /// Advisory plan. Uses the cached readiness report when there is one.
    pub async fn generate_plan(
        &self,
        device: &Device,
        target_version: &str,
    ) -> Result<UpgradePlan, UpgradeError> {
        let readiness = match self.cached_readiness(&device.id, target_version) {
            Some(report) => report,
            None => self.check_readiness(device, target_version).await?,
        };
        let image = readiness
            .image
            .clone()
            .ok_or_else(|| UpgradeError::ImageNotFound(target_version.to_string()))?;
        Ok(build_plan(&readiness, &image, &self.config))
    }

    /// Execute an upgrade job to its outcome.
    pub async fn run(&self, job: &Job, device: &Device, target_version: &str) -> JobOutcome {
        let mut ctx = RunContext {
            job,
            device,
            report: UpgradeReport::new(target_version),
            mutated: false,
        };
        // Readiness was spent on this job.
        self.readiness.invalidate(&device.id);

        let mut session = match self.transport.connect(device).await {
            Ok(session) => session,
            Err(e) => {
                return self.fail(&mut ctx, FailureKind::Transport, format!("connect failed: {}", e))
            }
        };
        let outcome = self.execute(&mut ctx, &mut session, target_version).await;
        if let Err(e) = self.transport.disconnect(&session).await {
            debug!(job_id = %job.id, "Disconnect after upgrade failed: {}", e);
        }
        outcome
    }

    async fn execute(
        &self,
        ctx: &mut RunContext<'_>,
        session: &mut DeviceSession,
        target_version: &str,
    ) -> JobOutcome {
        // Pre-checks
        self.begin(ctx, UpgradePhase::PreChecks);
        let image = match self.catalog.find(target_version) {
            Ok(Some(image)) => image,
            Ok(None) => {
                return self.fail(
                    ctx,
                    FailureKind::Internal,
                    format!("firmware {} is no longer in the catalog", target_version),
                )
            }
            Err(e) => return self.fail(ctx, FailureKind::Internal, e.to_string()),
        };
        ctx.report.image_file = Some(image.file_name.clone());
        let expected = match self.catalog.checksum(&image).await {
            Ok(sum) => sum,
            Err(e) => return self.fail(ctx, FailureKind::Internal, e.to_string()),
        };
        ctx.report.expected_checksum = Some(expected.clone());

        let facts = match self.transport.get_facts(session).await {
            Ok(facts) => facts,
            Err(e) => return self.fail(ctx, FailureKind::Transport, e.to_string()),
        };
        ctx.report.previous_version = Some(facts.version.clone());
        match self.transport.get_storage(session).await {
            Ok(storage) => {
                let required = self.config.required_free_bytes(image.size_bytes);
                if storage.available_bytes < required {
                    return self.fail(
                        ctx,
                        FailureKind::ValidationError,
                        format!(
                            "pre-check failed: {} bytes free, {} required",
                            storage.available_bytes, required
                        ),
                    );
                }
            }
            Err(e) => return self.fail(ctx, FailureKind::Transport, e.to_string()),
        }
        self.complete(ctx, Some(format!("running {}", facts.version)))
            .await;

        // Pre-backup
        self.begin(ctx, UpgradePhase::PreBackup);
        match self.snapshot(ctx, session, SnapshotTrigger::PreUpgrade).await {
            Ok(id) => {
                ctx.report.pre_snapshot_id = Some(id.clone());
                self.complete(ctx, Some(id)).await;
            }
            Err(outcome) => return outcome,
        }

        // Transfer
        self.begin(ctx, UpgradePhase::ImageTransfer);
        let transfer = ImageTransfer {
            local_path: image.path.clone(),
            file_name: image.file_name.clone(),
            size_bytes: image.size_bytes,
        };
        let remote_path = match self.transport.transfer_image(session, &transfer).await {
            Ok(path) => path,
            Err(e) => {
                return self.fail(ctx, FailureKind::Transport, format!("image transfer failed: {}", e))
            }
        };
        self.complete(ctx, Some(remote_path.clone())).await;

        // Checksum
        self.begin(ctx, UpgradePhase::ChecksumValidation);
        let actual = match self.transport.remote_checksum(session, &remote_path).await {
            Ok(sum) => sum,
            Err(e) => return self.fail(ctx, FailureKind::Transport, e.to_string()),
        };
        ctx.report.remote_checksum = Some(actual.clone());
        if actual != expected {
            return self.fail(
                ctx,
                FailureKind::ChecksumMismatch,
                format!(
                    "checksum mismatch for {}: expected {}, device has {}",
                    image.file_name, expected, actual
                ),
            );
        }
        self.complete(ctx, None).await;

        // Install
        self.begin(ctx, UpgradePhase::Install);
        ctx.mutated = true;
        if let Err(e) = self.transport.install_package(session, &remote_path).await {
            return self.fail(ctx, FailureKind::Transport, format!("install failed: {}", e));
        }
        self.complete(ctx, None).await;

        // Reboot
        self.begin(ctx, UpgradePhase::Reboot);
        match self.transport.reboot(session).await {
            Ok(()) => {}
            // The session usually dies with the reboot.
            Err(e) if e.is_unreachable() => {
                debug!(job_id = %ctx.job.id, "Reboot dropped the session: {}", e)
            }
            Err(e) => return self.fail(ctx, FailureKind::Transport, format!("reboot failed: {}", e)),
        }
        let rebooted_at = Instant::now();
        self.complete(ctx, None).await;

        // Reachability wait
        self.begin(ctx, UpgradePhase::ReachabilityWait);
        let facts = match self.wait_for_reboot(ctx.device, rebooted_at).await {
            Some((fresh, facts)) => {
                *session = fresh;
                facts
            }
            None => {
                let waited = rebooted_at.elapsed().as_secs();
                ctx.report.outcome = Some(UpgradeOutcome::UnreachableTimeout);
                return self.fail(
                    ctx,
                    FailureKind::UnreachableTimeout,
                    format!(
                        "device did not come back within {}s of reboot; investigate manually",
                        waited
                    ),
                );
            }
        };
        self.complete(ctx, Some(format!("back after {}s", rebooted_at.elapsed().as_secs())))
            .await;

        // Post-validation
        self.begin(ctx, UpgradePhase::PostValidation);
        ctx.report.new_version = Some(facts.version.clone());
        let validated = facts.version == target_version;
        if validated {
            self.complete(ctx, Some(format!("running {}", facts.version)))
                .await;
        } else {
            self.end_phase(
                ctx,
                PhaseStatus::Failed,
                Some(format!("running {}, expected {}", facts.version, target_version)),
            )
            .await;
        }

        // Post-backup runs either way so the operator has the current state.
        self.begin(ctx, UpgradePhase::PostBackup);
        match self.snapshot(ctx, session, SnapshotTrigger::PostUpgrade).await {
            Ok(id) => {
                ctx.report.post_snapshot_id = Some(id.clone());
                self.complete(ctx, Some(id)).await;
            }
            Err(outcome) if validated => return outcome,
            Err(_) => {}
        }

        if validated {
            ctx.report.outcome = Some(UpgradeOutcome::ValidatedSuccess);
            info!(
                job_id = %ctx.job.id,
                device_id = %ctx.device.id,
                version = %target_version,
                "Upgrade validated"
            );
            JobOutcome::success(ctx.report.to_value())
        } else {
            ctx.report.outcome = Some(UpgradeOutcome::ValidationFailed);
            let error = format!(
                "device runs {} after upgrade, expected {}; requires manual rollback",
                facts.version, target_version
            );
            warn!(job_id = %ctx.job.id, device_id = %ctx.device.id, "{}", error);
            JobOutcome::failed(
                FailureKind::ValidationFailedPostUpgrade,
                error,
                ctx.report.to_value(),
            )
        }
    }

    /// Wait for the device to answer with an uptime that proves it rebooted.
    async fn wait_for_reboot(
        &self,
        device: &Device,
        rebooted_at: Instant,
    ) -> Option<(DeviceSession, crate::device::DeviceFacts)> {
        let policy = &self.config.reachability;
        let deadline = rebooted_at + policy.ceiling();
        let mut backoff = policy.backoff();

        sleep(policy.grace()).await;
        loop {
            let session =
                reconnect_until(self.transport.as_ref(), device, &mut backoff, deadline).await?;
            match self.transport.get_facts(&session).await {
                Ok(facts) if facts.uptime_secs <= rebooted_at.elapsed().as_secs() => {
                    return Some((session, facts))
                }
                Ok(facts) => debug!(
                    device_id = %device.id,
                    uptime = facts.uptime_secs,
                    "Device answered but has not rebooted yet"
                ),
                Err(e) => debug!(device_id = %device.id, "Facts after reboot failed: {}", e),
            }
            let _ = self.transport.disconnect(&session).await;
            if !backoff.wait(deadline).await {
                return None;
            }
        }
    }

    async fn snapshot(
        &self,
        ctx: &mut RunContext<'_>,
        session: &DeviceSession,
        trigger: SnapshotTrigger,
    ) -> Result<String, JobOutcome> {
        let content = match self.transport.fetch_config(session).await {
            Ok(content) => content,
            Err(e) => return Err(self.fail(ctx, FailureKind::Transport, e.to_string())),
        };
        let request = SnapshotRequest::for_device(ctx.device, content, trigger)
            .with_job(ctx.job.id.clone())
            .with_message(format!("{} for job {}", trigger, ctx.job.id));
        match capture_snapshot(self.snapshots.as_ref(), &self.audit, request).await {
            Ok(snapshot) => Ok(snapshot.id),
            Err(e) => Err(self.fail(ctx, FailureKind::Internal, format!("{} snapshot: {}", trigger, e))),
        }
    }

    fn begin(&self, ctx: &mut RunContext<'_>, phase: UpgradePhase) {
        debug!(job_id = %ctx.job.id, phase = phase.as_str(), "Upgrade phase started");
        ctx.report.begin(phase);
        self.progress(ctx);
    }

    async fn complete(&self, ctx: &mut RunContext<'_>, detail: Option<String>) {
        self.end_phase(ctx, PhaseStatus::Completed, detail).await;
    }

    async fn end_phase(&self, ctx: &mut RunContext<'_>, status: PhaseStatus, detail: Option<String>) {
        if let Some(phase) = ctx.report.end(status, detail.clone()) {
            let status = match status {
                PhaseStatus::Running => "running",
                PhaseStatus::Completed => "completed",
                PhaseStatus::Failed => "failed",
            };
            metrics::UPGRADE_PHASES
                .with_label_values(&[phase.as_str(), status])
                .inc();
            self.progress(ctx);
            self.audit
                .emit(AuditEvent::UpgradePhaseCompleted {
                    job_id: ctx.job.id.clone(),
                    device_id: ctx.device.id.clone(),
                    phase: phase.as_str().to_string(),
                    status: status.to_string(),
                    detail,
                })
                .await;
        }
    }

    fn progress(&self, ctx: &RunContext<'_>) {
        if let Err(e) = self.ledger.update_result(&ctx.job.id, ctx.report.to_value()) {
            warn!(job_id = %ctx.job.id, "Failed to record upgrade progress: {}", e);
        }
    }

    fn fail(&self, ctx: &mut RunContext<'_>, kind: FailureKind, error: String) -> JobOutcome {
        warn!(job_id = %ctx.job.id, device_id = %ctx.device.id, failure = %kind, "{}", error);
        if let Some(phase) = ctx.report.end(PhaseStatus::Failed, Some(error.clone())) {
            metrics::UPGRADE_PHASES
                .with_label_values(&[phase.as_str(), "failed"])
                .inc();
        }
        if ctx.report.outcome.is_none() {
            ctx.report.outcome = Some(UpgradeOutcome::Aborted);
        }
        let outcome = JobOutcome::failed(kind, error, ctx.report.to_value());
        if ctx.mutated {
            outcome.with_attention()
        } else {
            outcome
        }
    }
}
