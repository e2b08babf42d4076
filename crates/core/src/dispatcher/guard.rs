//! Scoped cleanup for dispatched jobs.

use std::sync::Arc;

use tracing::error;

use crate::ledger::JobLedger;
use crate::metrics;

/// Fails the job and releases its device lock if the worker goes away
/// without recording a terminal state (panic, early return, runtime
/// shutdown). Disarm once the terminal transition is written.
pub struct JobGuard {
    ledger: Arc<dyn JobLedger>,
    job_id: String,
    armed: bool,
    running: bool,
}

impl JobGuard {
    pub fn new(ledger: Arc<dyn JobLedger>, job_id: impl Into<String>) -> Self {
        Self {
            ledger,
            job_id: job_id.into(),
            armed: true,
            running: false,
        }
    }

    /// The job took a worker slot.
    pub fn started(&mut self) {
        if !self.running {
            self.running = true;
            metrics::JOBS_RUNNING.inc();
        }
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if self.running {
            metrics::JOBS_RUNNING.dec();
        }
        if !self.armed {
            return;
        }
        if let Err(e) = self
            .ledger
            .abort(&self.job_id, "worker exited without finishing the job")
        {
            error!(job_id = %self.job_id, "Failed to abort abandoned job: {}", e);
        }
    }
}
