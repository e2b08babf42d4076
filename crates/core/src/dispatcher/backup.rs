//! The backup routine: fetch the running configuration and snapshot it.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::audit::AuditHandle;
use crate::device::{Device, DeviceTransport};
use crate::ledger::{FailureKind, Job, JobOutcome};
use crate::snapshot::{capture_snapshot, sha256_hex, SnapshotRequest, SnapshotStore, SnapshotTrigger};

/// Result payload stored on a backup job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupReport {
    pub trigger: SnapshotTrigger,
    pub snapshot_id: String,
    pub commit_ref: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_snapshot_id: Option<String>,
    /// Whether the content differs from the previous snapshot.
    pub changed: bool,
}

pub async fn run_backup(
    transport: &dyn DeviceTransport,
    snapshots: &dyn SnapshotStore,
    audit: &AuditHandle,
    job: &Job,
    device: &Device,
    trigger: SnapshotTrigger,
) -> JobOutcome {
    let session = match transport.connect(device).await {
        Ok(session) => session,
        Err(e) => return transport_failure(job, format!("connect failed: {}", e)),
    };
    let fetched = transport.fetch_config(&session).await;
    if let Err(e) = transport.disconnect(&session).await {
        debug!(job_id = %job.id, "Disconnect after backup failed: {}", e);
    }
    let content = match fetched {
        Ok(content) => content,
        Err(e) => return transport_failure(job, format!("fetch config failed: {}", e)),
    };

    let previous = match snapshots.latest(&device.id) {
        Ok(previous) => previous,
        Err(e) => {
            return JobOutcome::failed(FailureKind::Internal, e.to_string(), serde_json::json!({}))
        }
    };
    let changed = previous
        .as_ref()
        .map_or(true, |p| p.content_hash != sha256_hex(content.as_bytes()));

    let request = SnapshotRequest::for_device(device, content, trigger)
        .with_job(job.id.clone())
        .with_message(format!("{} backup", trigger));
    match capture_snapshot(snapshots, audit, request).await {
        Ok(snapshot) => {
            let report = BackupReport {
                trigger,
                snapshot_id: snapshot.id,
                commit_ref: snapshot.commit_ref,
                size_bytes: snapshot.size_bytes,
                previous_snapshot_id: previous.map(|p| p.id),
                changed,
            };
            JobOutcome::success(serde_json::to_value(&report).unwrap_or_default())
        }
        Err(e) => JobOutcome::failed(
            FailureKind::Internal,
            format!("snapshot failed: {}", e),
            serde_json::json!({}),
        ),
    }
}

fn transport_failure(job: &Job, error: String) -> JobOutcome {
    warn!(job_id = %job.id, device_id = %job.device_id, "Backup failed: {}", error);
    JobOutcome::failed(FailureKind::Transport, error, serde_json::json!({}))
}
