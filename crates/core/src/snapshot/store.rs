//! Snapshot store trait.

use thiserror::Error;

use super::types::{Snapshot, SnapshotRequest};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Snapshot not found: {0}")]
    NotFound(String),

    /// Stored content no longer matches its recorded hash.
    #[error("Snapshot {id} is corrupt: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Repository I/O error: {0}")]
    Io(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl From<std::io::Error> for SnapshotError {
    fn from(e: std::io::Error) -> Self {
        SnapshotError::Io(e.to_string())
    }
}

/// Append-only, content-addressed store of device configurations.
///
/// Every `snapshot` call creates exactly one new entry; entries are never
/// mutated or deleted.
pub trait SnapshotStore: Send + Sync {
    fn snapshot(&self, request: SnapshotRequest) -> Result<Snapshot, SnapshotError>;

    fn get(&self, id: &str) -> Result<Option<Snapshot>, SnapshotError>;

    /// Exact content that was recorded.
    fn retrieve(&self, id: &str) -> Result<String, SnapshotError>;

    /// Unified line diff from `from_id` to `to_id`; empty when identical.
    fn diff(&self, from_id: &str, to_id: &str) -> Result<String, SnapshotError>;

    /// Device history, most recent first.
    fn history(&self, device_id: &str, limit: i64, offset: i64)
        -> Result<Vec<Snapshot>, SnapshotError>;

    fn count(&self, device_id: &str) -> Result<i64, SnapshotError>;

    fn latest(&self, device_id: &str) -> Result<Option<Snapshot>, SnapshotError>;

    /// Re-hash the stored content. `Ok(false)` means corruption.
    fn verify(&self, id: &str) -> Result<bool, SnapshotError>;
}
