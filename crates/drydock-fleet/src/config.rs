// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fleet configuration loaded from environment variables.

use std::time::Duration;

/// Machine types the control plane can provision.
pub const MACHINE_TYPES: &[&str] = &[
    "n1-standard-1",
    "n1-standard-2",
    "n1-standard-4",
    "n1-standard-8",
    "n1-standard-16",
    "n1-highmem-2",
    "n1-highmem-4",
    "n1-highmem-8",
];

/// Smallest data disk a node can have.
pub const MIN_STORAGE_GIB: i64 = 10;

/// Fleet-wide settings shared by every machine.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Locations clusters may be created in.
    pub locations: Vec<String>,
    /// Bucket holding WAL archives and base backups.
    pub backup_bucket: String,
    /// Upper bound for requested storage and for autoresize.
    pub max_storage_gib: i64,
    /// End-to-end test mode: restores may target the backup completion time itself.
    pub e2e: bool,
    /// Engine extension version for new clusters.
    pub default_engine_version: String,
    /// Extras extension version for new clusters.
    pub default_extras_version: String,
    /// Image minor version for new clusters.
    pub default_minor_version: String,
    /// How long a node must stay unavailable before an incident is opened.
    pub unavailable_escalation: Duration,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            locations: vec!["us-central1".to_string()],
            backup_bucket: "drydock-wal".to_string(),
            max_storage_gib: 4096,
            e2e: false,
            default_engine_version: "0.3.0".to_string(),
            default_extras_version: "0.2.0".to_string(),
            default_minor_version: "1".to_string(),
            unavailable_escalation: Duration::from_secs(300),
        }
    }
}

impl FleetConfig {
    /// Load configuration from environment variables.
    ///
    /// All optional:
    /// - `DRYDOCK_LOCATIONS`: Comma separated locations (default: us-central1)
    /// - `DRYDOCK_BACKUP_BUCKET`: Backup bucket (default: drydock-wal)
    /// - `DRYDOCK_MAX_STORAGE_GIB`: Storage ceiling (default: 4096)
    /// - `DRYDOCK_E2E`: `true`/`1` enables test mode (default: false)
    /// - `DRYDOCK_DEFAULT_ENGINE_VERSION` (default: 0.3.0)
    /// - `DRYDOCK_DEFAULT_EXTRAS_VERSION` (default: 0.2.0)
    /// - `DRYDOCK_DEFAULT_MINOR_VERSION` (default: 1)
    /// - `DRYDOCK_UNAVAILABLE_ESCALATION_SECS` (default: 300)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let locations = match std::env::var("DRYDOCK_LOCATIONS") {
            Ok(raw) => {
                let list: Vec<String> = raw
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                if list.is_empty() {
                    return Err(ConfigError::Invalid(
                        "DRYDOCK_LOCATIONS",
                        "must name at least one location",
                    ));
                }
                list
            }
            Err(_) => defaults.locations,
        };

        let max_storage_gib: i64 = std::env::var("DRYDOCK_MAX_STORAGE_GIB")
            .unwrap_or_else(|_| "4096".to_string())
            .parse()
            .ok()
            .filter(|n| *n >= MIN_STORAGE_GIB)
            .ok_or(ConfigError::Invalid(
                "DRYDOCK_MAX_STORAGE_GIB",
                "must be an integer of at least 10",
            ))?;

        let e2e = match std::env::var("DRYDOCK_E2E") {
            Ok(v) => match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" | "" => false,
                _ => return Err(ConfigError::Invalid("DRYDOCK_E2E", "must be a boolean")),
            },
            Err(_) => false,
        };

        let escalation_secs: u64 = std::env::var("DRYDOCK_UNAVAILABLE_ESCALATION_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "DRYDOCK_UNAVAILABLE_ESCALATION_SECS",
                    "must be a positive integer",
                )
            })?;

        Ok(Self {
            locations,
            backup_bucket: std::env::var("DRYDOCK_BACKUP_BUCKET")
                .unwrap_or(defaults.backup_bucket),
            max_storage_gib,
            e2e,
            default_engine_version: std::env::var("DRYDOCK_DEFAULT_ENGINE_VERSION")
                .unwrap_or(defaults.default_engine_version),
            default_extras_version: std::env::var("DRYDOCK_DEFAULT_EXTRAS_VERSION")
                .unwrap_or(defaults.default_extras_version),
            default_minor_version: std::env::var("DRYDOCK_DEFAULT_MINOR_VERSION")
                .unwrap_or(defaults.default_minor_version),
            unavailable_escalation: Duration::from_secs(escalation_secs),
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "DRYDOCK_LOCATIONS",
        "DRYDOCK_BACKUP_BUCKET",
        "DRYDOCK_MAX_STORAGE_GIB",
        "DRYDOCK_E2E",
        "DRYDOCK_DEFAULT_ENGINE_VERSION",
        "DRYDOCK_DEFAULT_EXTRAS_VERSION",
        "DRYDOCK_DEFAULT_MINOR_VERSION",
        "DRYDOCK_UNAVAILABLE_ESCALATION_SECS",
    ];

    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn cleared() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for key in VARS {
                guard.vars.push((key.to_string(), env::var(key).ok()));
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe { env::remove_var(key) };
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..) {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_defaults_match_default_impl() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::cleared();

        let config = FleetConfig::from_env().unwrap();
        let defaults = FleetConfig::default();

        assert_eq!(config.locations, defaults.locations);
        assert_eq!(config.backup_bucket, "drydock-wal");
        assert_eq!(config.max_storage_gib, 4096);
        assert!(!config.e2e);
        assert_eq!(config.unavailable_escalation, Duration::from_secs(300));
    }

    #[test]
    fn test_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::cleared();
        guard.set("DRYDOCK_LOCATIONS", "europe-west1, us-east1");
        guard.set("DRYDOCK_E2E", "true");
        guard.set("DRYDOCK_MAX_STORAGE_GIB", "512");

        let config = FleetConfig::from_env().unwrap();

        assert_eq!(config.locations, vec!["europe-west1", "us-east1"]);
        assert!(config.e2e);
        assert_eq!(config.max_storage_gib, 512);
    }

    #[test]
    fn test_rejects_tiny_storage_ceiling() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::cleared();
        guard.set("DRYDOCK_MAX_STORAGE_GIB", "5");

        let err = FleetConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("DRYDOCK_MAX_STORAGE_GIB", _)));
    }

    #[test]
    fn test_rejects_bad_e2e_flag() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::cleared();
        guard.set("DRYDOCK_E2E", "maybe");

        assert!(FleetConfig::from_env().is_err());
    }
}
