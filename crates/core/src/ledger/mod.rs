//! Job ledger: durable job records and the per-device lock registry.

mod sqlite;
mod store;
mod types;

pub use sqlite::SqliteJobLedger;
pub use store::{CreateJobRequest, JobFilter, JobLedger, LedgerError};
pub use types::{DeviceLock, FailureKind, Job, JobKind, JobOutcome, JobStats, JobStatus};
