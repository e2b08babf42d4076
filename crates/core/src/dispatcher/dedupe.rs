//! Short-lived memory of finished triggers.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::ledger::JobKind;
use crate::snapshot::sha256_hex;

struct Finished {
    fingerprint: String,
    job_id: String,
    at: Instant,
}

/// Remembers the last finished job per (device, kind) for the dedupe window.
///
/// Entries are written just before the job's terminal transition releases
/// the device lock, so a repeat of the same request can never slip in
/// between the lock release and the entry.
pub struct RecentTriggers {
    window: Duration,
    entries: HashMap<(String, JobKind), Finished>,
}

impl RecentTriggers {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: HashMap::new(),
        }
    }

    /// The job that just handled an identical request, if any.
    pub fn duplicate_of(&mut self, device_id: &str, kind: JobKind, fingerprint: &str) -> Option<String> {
        let window = self.window;
        self.entries
            .retain(|_, finished| finished.at.elapsed() < window);
        self.entries
            .get(&(device_id.to_string(), kind))
            .filter(|finished| finished.fingerprint == fingerprint)
            .map(|finished| finished.job_id.clone())
    }

    pub fn record(&mut self, device_id: &str, kind: JobKind, fingerprint: String, job_id: &str) {
        self.entries.insert(
            (device_id.to_string(), kind),
            Finished {
                fingerprint,
                job_id: job_id.to_string(),
                at: Instant::now(),
            },
        );
    }
}

/// Stable fingerprint of trigger parameters.
pub fn fingerprint(params: &serde_json::Value) -> String {
    sha256_hex(params.to_string().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_within_window_only() {
        let mut recent = RecentTriggers::new(Duration::from_secs(5));
        let fp = fingerprint(&json!({"trigger": "manual"}));
        recent.record("42", JobKind::Backup, fp.clone(), "job-1");

        assert_eq!(
            recent.duplicate_of("42", JobKind::Backup, &fp).as_deref(),
            Some("job-1")
        );
        assert!(recent.duplicate_of("43", JobKind::Backup, &fp).is_none());
        assert!(recent.duplicate_of("42", JobKind::Upgrade, &fp).is_none());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(recent.duplicate_of("42", JobKind::Backup, &fp).is_none());
    }

    #[test]
    fn test_distinct_params_are_not_duplicates() {
        let mut recent = RecentTriggers::new(Duration::from_secs(5));
        recent.record(
            "42",
            JobKind::Upgrade,
            fingerprint(&json!({"target_version": "21.4R3"})),
            "job-1",
        );
        let other = fingerprint(&json!({"target_version": "22.1R1"}));
        assert!(recent.duplicate_of("42", JobKind::Upgrade, &other).is_none());
    }
}
