//! Open confirm windows, keyed by job id.
//!
//! Each window is a oneshot channel. Whichever side removes the entry first
//! decides the window: an explicit confirm removes it and sends the source,
//! expiry removes it without sending. The loser finds nothing to remove.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::oneshot;

use super::types::{ChangeError, ConfirmationSource};

#[derive(Default)]
pub struct ConfirmRegistry {
    windows: Mutex<HashMap<String, oneshot::Sender<ConfirmationSource>>>,
}

impl ConfirmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a window for `job_id`. A window left over from an earlier run of
    /// the same job is replaced.
    pub fn open(&self, job_id: &str) -> oneshot::Receiver<ConfirmationSource> {
        let (tx, rx) = oneshot::channel();
        self.windows.lock().unwrap().insert(job_id.to_string(), tx);
        rx
    }

    /// Confirm the window for `job_id`.
    pub fn confirm(&self, job_id: &str, source: ConfirmationSource) -> Result<(), ChangeError> {
        let sender = self.windows.lock().unwrap().remove(job_id);
        match sender {
            Some(tx) => tx
                .send(source)
                .map_err(|_| ChangeError::NotAwaitingConfirmation(job_id.to_string())),
            None => Err(ChangeError::NotAwaitingConfirmation(job_id.to_string())),
        }
    }

    /// Close the window on expiry. Returns false if a confirm got there first.
    pub fn close(&self, job_id: &str) -> bool {
        self.windows.lock().unwrap().remove(job_id).is_some()
    }

    pub fn is_open(&self, job_id: &str) -> bool {
        self.windows.lock().unwrap().contains_key(job_id)
    }

    /// Job ids with an open window, sorted.
    pub fn open_windows(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.windows.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_confirm_delivers_source() {
        let registry = ConfirmRegistry::new();
        let rx = registry.open("job-1");
        assert!(registry.is_open("job-1"));

        registry.confirm("job-1", ConfirmationSource::Operator).unwrap();
        assert_eq!(rx.await.unwrap(), ConfirmationSource::Operator);
        assert!(!registry.is_open("job-1"));
    }

    #[test]
    fn test_confirm_unknown_job() {
        let registry = ConfirmRegistry::new();
        assert_eq!(
            registry.confirm("nope", ConfirmationSource::Operator),
            Err(ChangeError::NotAwaitingConfirmation("nope".to_string()))
        );
    }

    #[test]
    fn test_expiry_then_confirm_loses() {
        let registry = ConfirmRegistry::new();
        let _rx = registry.open("job-1");
        assert!(registry.close("job-1"));
        assert!(registry.confirm("job-1", ConfirmationSource::Operator).is_err());
    }

    #[tokio::test]
    async fn test_confirm_then_expiry_loses() {
        let registry = ConfirmRegistry::new();
        let rx = registry.open("job-1");
        registry.confirm("job-1", ConfirmationSource::Auto).unwrap();
        assert!(!registry.close("job-1"));
        assert_eq!(rx.await.unwrap(), ConfirmationSource::Auto);
    }

    #[test]
    fn test_second_confirm_rejected() {
        let registry = ConfirmRegistry::new();
        let _rx = registry.open("job-1");
        registry.confirm("job-1", ConfirmationSource::Operator).unwrap();
        assert!(registry.confirm("job-1", ConfirmationSource::Operator).is_err());
    }

    #[test]
    fn test_dropped_receiver_is_not_confirmable() {
        let registry = ConfirmRegistry::new();
        drop(registry.open("job-1"));
        assert!(registry.confirm("job-1", ConfirmationSource::Operator).is_err());
        assert!(registry.open_windows().is_empty());
    }
}
