//! SQLite-backed job ledger.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};

use super::{
    CreateJobRequest, DeviceLock, FailureKind, Job, JobFilter, JobKind, JobLedger, JobOutcome,
    JobStats, JobStatus, LedgerError,
};

const JOB_COLUMNS: &str = "id, kind, device_id, status, requested_by, params, queued_at, \
     started_at, finished_at, result, error, failure, needs_attention";

/// SQLite-backed job ledger. Jobs and device locks share one connection so
/// lock acquisition and release always commit together with the job row.
pub struct SqliteJobLedger {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> LedgerError {
    LedgerError::Database(e.to_string())
}

fn parse_time(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

impl SqliteJobLedger {
    /// Open (or create) the ledger in the database file at `path`.
    pub fn new(path: &Path) -> Result<Self, LedgerError> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory ledger (useful for testing).
    pub fn in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), LedgerError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                device_id TEXT NOT NULL,
                status TEXT NOT NULL,
                requested_by TEXT NOT NULL,
                params TEXT NOT NULL,
                queued_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                result TEXT,
                error TEXT,
                failure TEXT,
                needs_attention INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_device ON jobs(device_id);
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_queued_at ON jobs(queued_at DESC);

            CREATE TABLE IF NOT EXISTS device_locks (
                device_id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                acquired_at TEXT NOT NULL
            );
            "#,
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn build_where_clause(filter: &JobFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            conditions.push("status = ?");
            params.push(Box::new(status.as_str()));
        }

        if let Some(kind) = filter.kind {
            conditions.push("kind = ?");
            params.push(Box::new(kind.as_str()));
        }

        if let Some(ref device_id) = filter.device_id {
            conditions.push("device_id = ?");
            params.push(Box::new(device_id.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let kind: String = row.get(1)?;
        let status: String = row.get(3)?;
        let params: String = row.get(5)?;
        let queued_at: String = row.get(6)?;
        let started_at: Option<String> = row.get(7)?;
        let finished_at: Option<String> = row.get(8)?;
        let result: Option<String> = row.get(9)?;
        let failure: Option<String> = row.get(11)?;
        let needs_attention: i64 = row.get(12)?;

        Ok(Job {
            id: row.get(0)?,
            kind: JobKind::parse(&kind).unwrap_or(JobKind::Backup),
            device_id: row.get(2)?,
            status: JobStatus::parse(&status).unwrap_or(JobStatus::Failed),
            requested_by: row.get(4)?,
            params: serde_json::from_str(&params).unwrap_or(serde_json::Value::Null),
            queued_at: parse_time(&queued_at),
            started_at: started_at.as_deref().map(parse_time),
            finished_at: finished_at.as_deref().map(parse_time),
            result: result.and_then(|json| serde_json::from_str(&json).ok()),
            error: row.get(10)?,
            failure: failure.as_deref().and_then(FailureKind::parse),
            needs_attention: needs_attention != 0,
        })
    }

    fn fetch(conn: &Connection, id: &str) -> Result<Job, LedgerError> {
        conn.query_row(
            &format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS),
            params![id],
            Self::row_to_job,
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| LedgerError::NotFound(id.to_string()))
    }

    fn current_lock(conn: &Connection, device_id: &str) -> Result<Option<DeviceLock>, LedgerError> {
        conn.query_row(
            "SELECT device_id, job_id, acquired_at FROM device_locks WHERE device_id = ?",
            params![device_id],
            |row| {
                let acquired_at: String = row.get(2)?;
                Ok(DeviceLock {
                    device_id: row.get(0)?,
                    job_id: row.get(1)?,
                    acquired_at: parse_time(&acquired_at),
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    fn release_for(tx: &Transaction, job: &Job) -> Result<(), LedgerError> {
        tx.execute(
            "DELETE FROM device_locks WHERE device_id = ? AND job_id = ?",
            params![job.device_id, job.id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn write_terminal(tx: &Transaction, job: &Job) -> Result<(), LedgerError> {
        let result = match &job.result {
            Some(value) => Some(
                serde_json::to_string(value).map_err(|e| LedgerError::Database(e.to_string()))?,
            ),
            None => None,
        };
        tx.execute(
            "UPDATE jobs SET status = ?, started_at = ?, finished_at = ?, result = ?, error = ?, \
             failure = ?, needs_attention = ? WHERE id = ?",
            params![
                job.status.as_str(),
                job.started_at.map(|t| t.to_rfc3339()),
                job.finished_at.map(|t| t.to_rfc3339()),
                result,
                job.error,
                job.failure.map(|f| f.as_str()),
                job.needs_attention as i64,
                job.id,
            ],
        )
        .map_err(db_err)?;
        Self::release_for(tx, job)
    }
}

impl JobLedger for SqliteJobLedger {
    fn create(&self, request: CreateJobRequest) -> Result<Job, LedgerError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        if let Some(lock) = Self::current_lock(&tx, &request.device_id)? {
            return Err(LedgerError::DeviceLocked {
                device_id: request.device_id,
                holder: lock.job_id,
            });
        }

        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            kind: request.kind,
            device_id: request.device_id,
            status: JobStatus::Pending,
            requested_by: request.requested_by,
            params: request.params,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
            failure: None,
            needs_attention: false,
        };

        let params_json =
            serde_json::to_string(&job.params).map_err(|e| LedgerError::Database(e.to_string()))?;

        tx.execute(
            &format!(
                "INSERT INTO jobs ({}) VALUES (?, ?, ?, ?, ?, ?, ?, NULL, NULL, NULL, NULL, NULL, 0)",
                JOB_COLUMNS
            ),
            params![
                job.id,
                job.kind.as_str(),
                job.device_id,
                job.status.as_str(),
                job.requested_by,
                params_json,
                job.queued_at.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;

        tx.execute(
            "INSERT INTO device_locks (device_id, job_id, acquired_at) VALUES (?, ?, ?)",
            params![job.device_id, job.id, job.queued_at.to_rfc3339()],
        )
        .map_err(db_err)?;

        tx.commit().map_err(db_err)?;
        Ok(job)
    }

    fn get(&self, id: &str) -> Result<Option<Job>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        match Self::fetch(&conn, id) {
            Ok(job) => Ok(Some(job)),
            Err(LedgerError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let (where_clause, mut params) = Self::build_where_clause(filter);

        let sql = format!(
            "SELECT {} FROM jobs {} ORDER BY queued_at DESC, rowid DESC LIMIT ? OFFSET ?",
            JOB_COLUMNS, where_clause
        );
        params.push(Box::new(filter.limit));
        params.push(Box::new(filter.offset));

        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let jobs = stmt
            .query_map(param_refs.as_slice(), Self::row_to_job)
            .map_err(db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_err)?;

        Ok(jobs)
    }

    fn count(&self, filter: &JobFilter) -> Result<i64, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let (where_clause, params) = Self::build_where_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        conn.query_row(&sql, param_refs.as_slice(), |row| row.get(0))
            .map_err(db_err)
    }

    fn stats(&self) -> Result<JobStats, LedgerError> {
        let conn = self.conn.lock().unwrap();
        let mut stats = JobStats::default();

        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(db_err)?;

        for row in rows {
            let (status, count) = row.map_err(db_err)?;
            stats.total += count;
            match JobStatus::parse(&status) {
                Some(JobStatus::Pending) => stats.pending = count,
                Some(JobStatus::Running) => stats.running = count,
                Some(JobStatus::Success) => stats.success = count,
                Some(JobStatus::Failed) => stats.failed = count,
                Some(JobStatus::Cancelled) => stats.cancelled = count,
                None => {}
            }
        }

        stats.needs_attention = conn
            .query_row(
                "SELECT COUNT(*) FROM jobs WHERE needs_attention = 1",
                [],
                |row| row.get(0),
            )
            .map_err(db_err)?;

        Ok(stats)
    }

    fn transition(&self, id: &str, status: JobStatus) -> Result<Job, LedgerError> {
        if !matches!(status, JobStatus::Running | JobStatus::Cancelled) {
            // Success/failed carry an outcome and go through `complete`.
            let conn = self.conn.lock().unwrap();
            let job = Self::fetch(&conn, id)?;
            return Err(LedgerError::InvalidTransition {
                job_id: id.to_string(),
                from: job.status,
                to: status,
            });
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let mut job = Self::fetch(&tx, id)?;

        if !job.status.can_transition_to(status) {
            return Err(LedgerError::InvalidTransition {
                job_id: id.to_string(),
                from: job.status,
                to: status,
            });
        }

        let now = Utc::now();
        job.status = status;
        match status {
            JobStatus::Running => {
                job.started_at = Some(now);
                tx.execute(
                    "UPDATE jobs SET status = ?, started_at = ? WHERE id = ?",
                    params![status.as_str(), now.to_rfc3339(), id],
                )
                .map_err(db_err)?;
            }
            _ => {
                job.finished_at = Some(now);
                Self::write_terminal(&tx, &job)?;
            }
        }

        tx.commit().map_err(db_err)?;
        Ok(job)
    }

    fn complete(&self, id: &str, outcome: JobOutcome) -> Result<Job, LedgerError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let mut job = Self::fetch(&tx, id)?;

        if !outcome.status.is_terminal()
            || outcome.status == JobStatus::Cancelled
            || !job.status.can_transition_to(outcome.status)
        {
            return Err(LedgerError::InvalidTransition {
                job_id: id.to_string(),
                from: job.status,
                to: outcome.status,
            });
        }

        job.status = outcome.status;
        job.finished_at = Some(Utc::now());
        job.result = Some(outcome.result);
        job.error = outcome.error;
        job.failure = outcome.failure;
        job.needs_attention = outcome.needs_attention;

        Self::write_terminal(&tx, &job)?;
        tx.commit().map_err(db_err)?;
        Ok(job)
    }

    fn abort(&self, id: &str, reason: &str) -> Result<Job, LedgerError> {
        // Runs from drop guards while unwinding; a panic inside another
        // ledger call must not turn into a double panic here.
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let mut job = Self::fetch(&tx, id)?;

        if job.status.is_terminal() {
            return Err(LedgerError::InvalidTransition {
                job_id: id.to_string(),
                from: job.status,
                to: JobStatus::Failed,
            });
        }

        job.status = JobStatus::Failed;
        job.finished_at = Some(Utc::now());
        job.error = Some(reason.to_string());
        job.failure = Some(FailureKind::Internal);
        job.needs_attention = true;

        Self::write_terminal(&tx, &job)?;
        tx.commit().map_err(db_err)?;
        Ok(job)
    }

    fn update_result(&self, id: &str, result: serde_json::Value) -> Result<(), LedgerError> {
        let conn = self.conn.lock().unwrap();
        let job = Self::fetch(&conn, id)?;
        if job.status.is_terminal() {
            return Err(LedgerError::InvalidTransition {
                job_id: id.to_string(),
                from: job.status,
                to: job.status,
            });
        }

        let json =
            serde_json::to_string(&result).map_err(|e| LedgerError::Database(e.to_string()))?;
        conn.execute(
            "UPDATE jobs SET result = ? WHERE id = ?",
            params![json, id],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn lock_holder(&self, device_id: &str) -> Result<Option<DeviceLock>, LedgerError> {
        let conn = self.conn.lock().unwrap();
        Self::current_lock(&conn, device_id)
    }

    fn release_lock(&self, device_id: &str) -> Result<Option<DeviceLock>, LedgerError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let Some(lock) = Self::current_lock(&tx, device_id)? else {
            return Ok(None);
        };

        match Self::fetch(&tx, &lock.job_id) {
            Ok(holder) if !holder.status.is_terminal() => {
                return Err(LedgerError::LockHeld {
                    device_id: device_id.to_string(),
                    job_id: lock.job_id,
                });
            }
            Ok(_) | Err(LedgerError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        tx.execute(
            "DELETE FROM device_locks WHERE device_id = ?",
            params![device_id],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(Some(lock))
    }

    fn recover(&self) -> Result<Vec<Job>, LedgerError> {
        let ids: Vec<String> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn
                .prepare("SELECT id FROM jobs WHERE status IN ('pending', 'running')")
                .map_err(db_err)?;
            let ids = stmt
                .query_map([], |row| row.get(0))
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            ids
        };

        ids.iter()
            .map(|id| self.abort(id, "interrupted by restart"))
            .collect()
    }
}
