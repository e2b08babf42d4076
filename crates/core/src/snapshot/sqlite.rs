//! SQLite-backed snapshot metadata over the content repository.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use super::diff::unified_diff;
use super::repository::{sha256_hex, ContentRepository};
use super::{Snapshot, SnapshotError, SnapshotRequest, SnapshotStore, SnapshotTrigger};

const SNAPSHOT_COLUMNS: &str =
    "id, device_id, commit_ref, content_hash, trigger_kind, taken_at, size_bytes, path, message, job_id";

/// Snapshot store: content in the repository, metadata in SQLite.
pub struct SqliteSnapshotStore {
    conn: Mutex<Connection>,
    repository: ContentRepository,
}

fn db_err(e: rusqlite::Error) -> SnapshotError {
    SnapshotError::Database(e.to_string())
}

impl SqliteSnapshotStore {
    pub fn new(db_path: &Path, repository_root: impl Into<PathBuf>) -> Result<Self, SnapshotError> {
        let conn = Connection::open(db_path).map_err(db_err)?;
        Self::with_connection(conn, repository_root)
    }

    /// In-memory metadata with an on-disk repository (useful for testing).
    pub fn in_memory(repository_root: impl Into<PathBuf>) -> Result<Self, SnapshotError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::with_connection(conn, repository_root)
    }

    fn with_connection(
        conn: Connection,
        repository_root: impl Into<PathBuf>,
    ) -> Result<Self, SnapshotError> {
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            repository: ContentRepository::open(repository_root)?,
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), SnapshotError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS snapshots (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                device_id TEXT NOT NULL,
                commit_ref TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                trigger_kind TEXT NOT NULL,
                taken_at TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                path TEXT NOT NULL,
                message TEXT NOT NULL,
                job_id TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_snapshots_device ON snapshots(device_id, seq DESC);
            CREATE INDEX IF NOT EXISTS idx_snapshots_job ON snapshots(job_id);
            "#,
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn repository(&self) -> &ContentRepository {
        &self.repository
    }

    fn row_to_snapshot(row: &rusqlite::Row) -> rusqlite::Result<Snapshot> {
        let trigger: String = row.get(4)?;
        let taken_at: String = row.get(5)?;
        let size_bytes: i64 = row.get(6)?;

        Ok(Snapshot {
            id: row.get(0)?,
            device_id: row.get(1)?,
            commit_ref: row.get(2)?,
            content_hash: row.get(3)?,
            trigger: SnapshotTrigger::parse(&trigger).unwrap_or(SnapshotTrigger::Manual),
            taken_at: DateTime::parse_from_rfc3339(&taken_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            size_bytes: size_bytes.max(0) as u64,
            path: row.get(7)?,
            message: row.get(8)?,
            job_id: row.get(9)?,
        })
    }

    fn require(&self, id: &str) -> Result<Snapshot, SnapshotError> {
        self.get(id)?
            .ok_or_else(|| SnapshotError::NotFound(id.to_string()))
    }
}

impl SnapshotStore for SqliteSnapshotStore {
    fn snapshot(&self, request: SnapshotRequest) -> Result<Snapshot, SnapshotError> {
        let bytes = request.content.as_bytes();
        let content_hash = self.repository.write_blob(bytes)?;
        let path = ContentRepository::log_path(&request.location);
        let message = request.commit_message();
        let taken_at = Utc::now();

        let commit = self
            .repository
            .commit(&path, &content_hash, &message, taken_at)?;

        let snapshot = Snapshot {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: request.device_id,
            commit_ref: commit.id,
            content_hash,
            trigger: request.trigger,
            taken_at,
            size_bytes: bytes.len() as u64,
            path,
            message,
            job_id: request.job_id,
        };

        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!(
                "INSERT INTO snapshots ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                SNAPSHOT_COLUMNS
            ),
            params![
                snapshot.id,
                snapshot.device_id,
                snapshot.commit_ref,
                snapshot.content_hash,
                snapshot.trigger.as_str(),
                snapshot.taken_at.to_rfc3339(),
                snapshot.size_bytes as i64,
                snapshot.path,
                snapshot.message,
                snapshot.job_id,
            ],
        )
        .map_err(|e| {
            // The commit stays in the log; it is simply unreferenced.
            warn!(commit = %snapshot.commit_ref, error = %e, "Snapshot metadata insert failed");
            db_err(e)
        })?;

        info!(
            snapshot_id = %snapshot.id,
            device_id = %snapshot.device_id,
            trigger = %snapshot.trigger,
            size = snapshot.size_bytes,
            "Snapshot recorded"
        );
        Ok(snapshot)
    }

    fn get(&self, id: &str) -> Result<Option<Snapshot>, SnapshotError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {} FROM snapshots WHERE id = ?", SNAPSHOT_COLUMNS),
            params![id],
            Self::row_to_snapshot,
        )
        .optional()
        .map_err(db_err)
    }

    fn retrieve(&self, id: &str) -> Result<String, SnapshotError> {
        let snapshot = self.require(id)?;
        let bytes = self.repository.read_blob(&snapshot.content_hash)?;
        String::from_utf8(bytes).map_err(|e| SnapshotError::Corrupt {
            id: id.to_string(),
            reason: format!("content is not valid UTF-8: {}", e),
        })
    }

    fn diff(&self, from_id: &str, to_id: &str) -> Result<String, SnapshotError> {
        let from = self.require(from_id)?;
        let to = self.require(to_id)?;
        if from.content_hash == to.content_hash {
            return Ok(String::new());
        }
        let old = self.retrieve(from_id)?;
        let new = self.retrieve(to_id)?;
        Ok(unified_diff(&old, &new, from_id, to_id))
    }

    fn history(
        &self,
        device_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Snapshot>, SnapshotError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM snapshots WHERE device_id = ? ORDER BY seq DESC LIMIT ? OFFSET ?",
                SNAPSHOT_COLUMNS
            ))
            .map_err(db_err)?;
        let snapshots = stmt
            .query_map(params![device_id, limit, offset], Self::row_to_snapshot)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;
        Ok(snapshots)
    }

    fn count(&self, device_id: &str) -> Result<i64, SnapshotError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM snapshots WHERE device_id = ?",
            params![device_id],
            |row| row.get(0),
        )
        .map_err(db_err)
    }

    fn latest(&self, device_id: &str) -> Result<Option<Snapshot>, SnapshotError> {
        Ok(self.history(device_id, 1, 0)?.into_iter().next())
    }

    fn verify(&self, id: &str) -> Result<bool, SnapshotError> {
        let snapshot = self.require(id)?;
        match self.repository.read_blob(&snapshot.content_hash) {
            Ok(bytes) => Ok(sha256_hex(&bytes) == snapshot.content_hash),
            Err(SnapshotError::Corrupt { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
