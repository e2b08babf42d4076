use std::sync::Arc;

use tokio::sync::mpsc;

use super::{AuditEventEnvelope, AuditHandle, AuditRecord, AuditStore};

/// Background task draining the audit channel into the store
pub struct AuditWriter {
    rx: mpsc::Receiver<AuditEventEnvelope>,
    store: Arc<dyn AuditStore>,
}

impl AuditWriter {
    pub fn new(rx: mpsc::Receiver<AuditEventEnvelope>, store: Arc<dyn AuditStore>) -> Self {
        Self { rx, store }
    }

    /// Consume events until every handle has been dropped.
    ///
    /// Spawn with `tokio::spawn(writer.run())`.
    pub async fn run(mut self) {
        tracing::info!("Audit writer started");

        while let Some(envelope) = self.rx.recv().await {
            let record = AuditRecord {
                id: 0,
                timestamp: envelope.timestamp,
                event_type: envelope.event.event_type().to_string(),
                job_id: envelope.event.job_id().map(String::from),
                device_id: envelope.event.device_id().map(String::from),
                data: envelope.event,
            };

            if let Err(e) = self.store.insert(&record) {
                tracing::error!(event_type = %record.event_type, "Failed to write audit event: {}", e);
            }
        }

        tracing::info!("Audit writer shutting down");
    }
}

/// Create the audit channel.
///
/// Returns the handle to clone into components and the writer to spawn.
/// Emitters wait once `buffer_size` events are queued.
pub fn create_audit_system(
    store: Arc<dyn AuditStore>,
    buffer_size: usize,
) -> (AuditHandle, AuditWriter) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (AuditHandle::new(tx), AuditWriter::new(rx, store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditEvent, AuditFilter, SqliteAuditStore};

    #[tokio::test]
    async fn test_writer_stores_events_with_extracted_ids() {
        let store = Arc::new(SqliteAuditStore::in_memory().unwrap());
        let (handle, writer) = create_audit_system(store.clone(), 10);
        let writer_task = tokio::spawn(writer.run());

        handle
            .emit(AuditEvent::JobCreated {
                job_id: "job-1".to_string(),
                device_id: "42".to_string(),
                kind: "backup".to_string(),
                requested_by: "alice".to_string(),
            })
            .await;
        handle
            .emit(AuditEvent::ServiceStopped {
                reason: "test".to_string(),
            })
            .await;

        drop(handle);
        writer_task.await.unwrap();

        let records = store.query(&AuditFilter::new()).unwrap();
        assert_eq!(records.len(), 2);
        let created = records
            .iter()
            .find(|r| r.event_type == "job_created")
            .unwrap();
        assert_eq!(created.job_id.as_deref(), Some("job-1"));
        assert_eq!(created.device_id.as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn test_writer_waits_for_all_handles() {
        let store = Arc::new(SqliteAuditStore::in_memory().unwrap());
        let (handle, writer) = create_audit_system(store.clone(), 10);
        let component_handle = handle.clone();
        let writer_task = tokio::spawn(writer.run());

        drop(handle);
        tokio::task::yield_now().await;
        assert!(!writer_task.is_finished());

        component_handle
            .emit(AuditEvent::ServiceStopped {
                reason: "graceful_shutdown".to_string(),
            })
            .await;
        drop(component_handle);

        tokio::time::timeout(std::time::Duration::from_secs(1), writer_task)
            .await
            .expect("writer should exit once all handles are dropped")
            .unwrap();
        assert_eq!(store.count(&AuditFilter::new()).unwrap(), 1);
    }
}
