//! Task dispatcher: trigger intake, deduplication, job routing and the
//! scheduled backup loop.

mod backup;
mod config;
mod dedupe;
mod guard;
mod runner;
mod types;

pub use backup::{run_backup, BackupReport};
pub use config::{DispatcherConfig, ScheduledBackupConfig};
pub use runner::TaskDispatcher;
pub use types::{DispatchError, DispatcherStatus, FleetBackupEntry};
