//! Snapshot store: append-only, content-addressed device configuration history.

mod capture;
mod diff;
mod repository;
mod sqlite;
mod store;
mod types;

pub use capture::capture_snapshot;
pub use diff::unified_diff;
pub use repository::{sha256_hex, CommitRecord, ContentRepository};
pub use sqlite::SqliteSnapshotStore;
pub use store::{SnapshotError, SnapshotStore};
pub use types::{Snapshot, SnapshotRequest, SnapshotTrigger};
