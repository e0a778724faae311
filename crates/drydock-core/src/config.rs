// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// drydock engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL
    pub database_url: String,
    /// How often the worker polls for due processes
    pub poll_interval: Duration,
    /// Maximum due processes fetched per poll
    pub batch_size: i64,
    /// How long a worker holds a process lease
    pub lease_duration: Duration,
    /// Maximum processes executed concurrently by one worker
    pub max_concurrent_processes: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `DRYDOCK_DATABASE_URL`: SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `DRYDOCK_POLL_INTERVAL_MS`: Worker poll interval (default: 1000)
    /// - `DRYDOCK_BATCH_SIZE`: Due processes per poll (default: 32)
    /// - `DRYDOCK_LEASE_SECS`: Process lease duration (default: 120)
    /// - `DRYDOCK_MAX_CONCURRENT_PROCESSES`: Concurrent invocations (default: 16)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DRYDOCK_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("DRYDOCK_DATABASE_URL"))?;

        let poll_interval_ms: u64 = std::env::var("DRYDOCK_POLL_INTERVAL_MS")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("DRYDOCK_POLL_INTERVAL_MS", "must be a positive integer")
            })?;

        let batch_size: i64 = std::env::var("DRYDOCK_BATCH_SIZE")
            .unwrap_or_else(|_| "32".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "DRYDOCK_BATCH_SIZE",
                "must be a positive integer",
            ))?;

        let lease_secs: u64 = std::env::var("DRYDOCK_LEASE_SECS")
            .unwrap_or_else(|_| "120".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("DRYDOCK_LEASE_SECS", "must be a positive integer"))?;

        let max_concurrent_processes: usize = std::env::var("DRYDOCK_MAX_CONCURRENT_PROCESSES")
            .unwrap_or_else(|_| "16".to_string())
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Invalid(
                "DRYDOCK_MAX_CONCURRENT_PROCESSES",
                "must be a positive integer",
            ))?;

        Ok(Self {
            database_url,
            poll_interval: Duration::from_millis(poll_interval_ms),
            batch_size,
            lease_duration: Duration::from_secs(lease_secs),
            max_concurrent_processes,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
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

    fn clear_optional(guard: &mut EnvGuard) {
        guard.remove("DRYDOCK_POLL_INTERVAL_MS");
        guard.remove("DRYDOCK_BATCH_SIZE");
        guard.remove("DRYDOCK_LEASE_SECS");
        guard.remove("DRYDOCK_MAX_CONCURRENT_PROCESSES");
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("DRYDOCK_DATABASE_URL", "sqlite:drydock.db");
        clear_optional(&mut guard);

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "sqlite:drydock.db");
        assert_eq!(config.poll_interval, Duration::from_millis(1000));
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.lease_duration, Duration::from_secs(120));
        assert_eq!(config.max_concurrent_processes, 16);
    }

    #[test]
    fn test_config_from_env_with_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("DRYDOCK_DATABASE_URL", "sqlite::memory:");
        clear_optional(&mut guard);
        guard.set("DRYDOCK_POLL_INTERVAL_MS", "250");
        guard.set("DRYDOCK_LEASE_SECS", "30");

        let config = Config::from_env().unwrap();

        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.lease_duration, Duration::from_secs(30));
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.remove("DRYDOCK_DATABASE_URL");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DRYDOCK_DATABASE_URL")));
    }

    #[test]
    fn test_config_rejects_zero_batch_size() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("DRYDOCK_DATABASE_URL", "sqlite::memory:");
        clear_optional(&mut guard);
        guard.set("DRYDOCK_BATCH_SIZE", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("DRYDOCK_BATCH_SIZE", _)));
    }
}
