//! `router_options` parsing
//!
//! A service may carry a compact option string such as
//! `max_replicas=2,selection_criterion=least_current_operations` that
//! overrides the values from its `[services.router]` table.

use super::{ConfigError, RouterSettings};

/// Apply a comma-separated `key=value` option string on top of `settings`
pub fn apply_router_options(
    settings: &RouterSettings,
    options: &str,
) -> Result<RouterSettings, ConfigError> {
    let mut settings = settings.clone();

    for entry in options.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (key, value) = entry
            .split_once('=')
            .map(|(k, v)| (k.trim(), v.trim()))
            .ok_or_else(|| {
                ConfigError::Invalid(format!("router option '{}' is not key=value", entry))
            })?;

        match key {
            "min_backends" => settings.min_backends = parse_number(key, value)?,
            "max_replicas" | "max_slave_connections" => {
                settings.max_replicas = parse_number(key, value)?
            }
            "selection_criterion" | "slave_selection_criteria" => {
                settings.selection_criterion = value.parse().map_err(ConfigError::Invalid)?
            }
            "max_replica_lag_ms" => settings.max_replica_lag_ms = Some(parse_number(key, value)?),
            "connect_timeout_ms" => settings.connect_timeout_ms = parse_number(key, value)?,
            "max_reconnect_attempts" => settings.max_reconnect_attempts = parse_number(key, value)?,
            _ => {
                return Err(ConfigError::Invalid(format!(
                    "unknown router option '{}'",
                    key
                )))
            }
        }
    }

    Ok(settings)
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("router option '{}' has invalid value '{}'", key, value)))
}
