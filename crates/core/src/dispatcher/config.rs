//! Dispatcher configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Jobs allowed to run at once. Extra jobs wait `pending` for a slot.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// After a job finishes, an identical trigger for the same device and
    /// kind is rejected as a duplicate for this long (milliseconds).
    #[serde(default = "default_dedupe_window")]
    pub dedupe_window_ms: u64,

    #[serde(default)]
    pub scheduled_backup: ScheduledBackupConfig,
}

/// Periodic fleet-wide backups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledBackupConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_backup_interval")]
    pub interval_secs: u64,
}

fn default_max_workers() -> usize {
    5
}

fn default_dedupe_window() -> u64 {
    5000 // 5 seconds
}

fn default_backup_interval() -> u64 {
    86_400 // daily
}

impl DispatcherConfig {
    pub fn dedupe_window(&self) -> Duration {
        Duration::from_millis(self.dedupe_window_ms)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            dedupe_window_ms: default_dedupe_window(),
            scheduled_backup: ScheduledBackupConfig::default(),
        }
    }
}

impl Default for ScheduledBackupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_backup_interval(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DispatcherConfig::default();
        assert_eq!(config.max_workers, 5);
        assert_eq!(config.dedupe_window(), Duration::from_secs(5));
        assert!(!config.scheduled_backup.enabled);
        assert_eq!(config.scheduled_backup.interval_secs, 86_400);
    }

    #[test]
    fn test_deserialize_partial() {
        let toml = r#"
            max_workers = 2

            [scheduled_backup]
            enabled = true
        "#;
        let config: DispatcherConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.dedupe_window_ms, 5000);
        assert!(config.scheduled_backup.enabled);
        assert_eq!(config.scheduled_backup.interval_secs, 86_400);
    }
}
