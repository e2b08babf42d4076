//! Commit-confirm configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::Backoff;

/// Confirm-window bounds and the reconciliation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitConfirmConfig {
    /// Auto-revert timeout used when a change does not ask for one.
    #[serde(default = "default_timeout")]
    pub default_timeout_secs: u64,

    #[serde(default = "default_min_timeout")]
    pub min_timeout_secs: u64,

    #[serde(default = "default_max_timeout")]
    pub max_timeout_secs: u64,

    /// How to wait for a device that dropped off during the window.
    #[serde(default)]
    pub reconcile: ReconcilePolicy,
}

/// Polling policy for re-establishing contact after a commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilePolicy {
    #[serde(default = "default_initial_interval")]
    pub initial_interval_ms: u64,

    #[serde(default = "default_max_interval")]
    pub max_interval_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Give up after `ceiling_factor` times the confirm timeout, measured
    /// from the commit.
    #[serde(default = "default_ceiling_factor")]
    pub ceiling_factor: f64,
}

fn default_timeout() -> u64 {
    300 // 5 minutes
}

fn default_min_timeout() -> u64 {
    1
}

fn default_max_timeout() -> u64 {
    3600 // 1 hour
}

fn default_initial_interval() -> u64 {
    2000
}

fn default_max_interval() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_ceiling_factor() -> f64 {
    2.0
}

impl Default for CommitConfirmConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout(),
            min_timeout_secs: default_min_timeout(),
            max_timeout_secs: default_max_timeout(),
            reconcile: ReconcilePolicy::default(),
        }
    }
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval(),
            max_interval_ms: default_max_interval(),
            backoff_multiplier: default_backoff_multiplier(),
            ceiling_factor: default_ceiling_factor(),
        }
    }
}

impl ReconcilePolicy {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.initial_interval_ms),
            Duration::from_millis(self.max_interval_ms),
            self.backoff_multiplier,
        )
    }

    /// Hard limit on reconciliation for a window of `timeout`.
    pub fn ceiling(&self, timeout: Duration) -> Duration {
        timeout.mul_f64(self.ceiling_factor.max(1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CommitConfirmConfig::default();
        assert_eq!(config.default_timeout_secs, 300);
        assert_eq!(config.min_timeout_secs, 1);
        assert_eq!(config.max_timeout_secs, 3600);
        assert_eq!(config.reconcile.initial_interval_ms, 2000);
        assert_eq!(
            config.reconcile.ceiling(Duration::from_secs(300)),
            Duration::from_secs(600)
        );
    }

    #[test]
    fn test_deserialize_partial_reconcile() {
        let toml = r#"
            default_timeout_secs = 60
            [reconcile]
            ceiling_factor = 4.0
        "#;
        let config: CommitConfirmConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.default_timeout_secs, 60);
        assert_eq!(config.max_timeout_secs, 3600);
        assert_eq!(config.reconcile.ceiling_factor, 4.0);
        assert_eq!(config.reconcile.max_interval_ms, 30_000);
    }
}
