use tracing::info;

use super::{Snapshot, SnapshotError, SnapshotRequest, SnapshotStore};
use crate::audit::{AuditEvent, AuditHandle};
use crate::metrics;

/// Store a snapshot and announce it on the audit trail.
pub async fn capture_snapshot(
    store: &dyn SnapshotStore,
    audit: &AuditHandle,
    request: SnapshotRequest,
) -> Result<Snapshot, SnapshotError> {
    let snapshot = store.snapshot(request)?;

    info!(
        snapshot_id = %snapshot.id,
        device_id = %snapshot.device_id,
        trigger = %snapshot.trigger,
        size = snapshot.size_bytes,
        "Snapshot taken"
    );
    metrics::SNAPSHOTS_TAKEN
        .with_label_values(&[snapshot.trigger.as_str()])
        .inc();
    audit
        .emit(AuditEvent::SnapshotTaken {
            snapshot_id: snapshot.id.clone(),
            device_id: snapshot.device_id.clone(),
            job_id: snapshot.job_id.clone(),
            trigger: snapshot.trigger.to_string(),
            commit_ref: snapshot.commit_ref.clone(),
            size_bytes: snapshot.size_bytes,
        })
        .await;

    Ok(snapshot)
}
