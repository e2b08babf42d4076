use std::collections::HashSet;

use super::{types::Config, ConfigError};

/// Validate configuration
/// Currently validates:
/// - Server port is not 0
/// - Gateway URL is http(s)
/// - Confirm-window bounds and reconciliation policy are coherent
/// - Post-reboot reachability backoff cannot spin
/// - Worker pool is not empty
/// - Device ids are non-empty and unique
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.server.port == 0 {
        return Err(ConfigError::ValidationError(
            "server.port cannot be 0".to_string(),
        ));
    }

    let url = &config.transport.gateway_url;
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ConfigError::ValidationError(format!(
            "transport.gateway_url must be an http(s) URL, got '{}'",
            url
        )));
    }

    let cc = &config.commit_confirm;
    if cc.min_timeout_secs == 0 || cc.min_timeout_secs > cc.max_timeout_secs {
        return Err(ConfigError::ValidationError(
            "commit_confirm.min_timeout_secs must be >= 1 and <= max_timeout_secs".to_string(),
        ));
    }
    if !(cc.min_timeout_secs..=cc.max_timeout_secs).contains(&cc.default_timeout_secs) {
        return Err(ConfigError::ValidationError(
            "commit_confirm.default_timeout_secs must lie within [min_timeout_secs, max_timeout_secs]"
                .to_string(),
        ));
    }
    if cc.reconcile.backoff_multiplier < 1.0 || cc.reconcile.ceiling_factor < 1.0 {
        return Err(ConfigError::ValidationError(
            "commit_confirm.reconcile multiplier and ceiling_factor must be >= 1.0".to_string(),
        ));
    }
    if cc.reconcile.initial_interval_ms == 0
        || cc.reconcile.initial_interval_ms > cc.reconcile.max_interval_ms
    {
        return Err(ConfigError::ValidationError(
            "commit_confirm.reconcile intervals must satisfy 0 < initial <= max".to_string(),
        ));
    }

    if config.upgrade.storage_headroom_factor < 1.0 {
        return Err(ConfigError::ValidationError(
            "upgrade.storage_headroom_factor must be >= 1.0".to_string(),
        ));
    }

    let rw = &config.upgrade.reachability;
    if rw.initial_interval_secs == 0 || rw.initial_interval_secs > rw.max_interval_secs {
        return Err(ConfigError::ValidationError(
            "upgrade.reachability intervals must satisfy 0 < initial <= max".to_string(),
        ));
    }
    if rw.backoff_multiplier < 1.0 {
        return Err(ConfigError::ValidationError(
            "upgrade.reachability.backoff_multiplier must be >= 1.0".to_string(),
        ));
    }
    if rw.ceiling_secs == 0 {
        return Err(ConfigError::ValidationError(
            "upgrade.reachability.ceiling_secs cannot be 0".to_string(),
        ));
    }

    if config.dispatcher.max_workers == 0 {
        return Err(ConfigError::ValidationError(
            "dispatcher.max_workers cannot be 0".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for device in &config.devices {
        if device.id.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "devices[].id cannot be empty".to_string(),
            ));
        }
        if !seen.insert(device.id.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "duplicate device id '{}'",
                device.id
            )));
        }
    }

    Ok(())
}
