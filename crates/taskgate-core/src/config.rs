// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use crate::dispatcher::DispatcherConfig;
use crate::reaper::TaskReaperConfig;
use crate::rebalancer::RebalancerConfig;

/// Taskgate Core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// QUIC address for the caller-facing delegate service
    pub service_addr: SocketAddr,
    /// QUIC address for delegate agents
    pub agent_addr: SocketAddr,
    /// Bounded wait of a SYNC submission
    pub sync_wait: Duration,
    /// Silence after which a delegate is considered lost
    pub delegate_heartbeat_timeout: Duration,
    /// Period of the expiry / lost-delegate reaper
    pub reaper_interval: Duration,
    /// Period of the perpetual task rebalancer
    pub rebalance_interval: Duration,
    /// Tolerated max-min perpetual task load difference between delegates
    pub rebalance_skew_threshold: usize,
    /// Exclusive pickup window of a task's preferred delegate
    pub broadcast_grace: Duration,
}

fn parse_var<T: std::str::FromStr>(
    key: &'static str,
    default: &str,
    reason: &'static str,
) -> Result<T, ConfigError> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(key, reason))
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `TASKGATE_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `TASKGATE_SERVICE_PORT` (9001)
    /// - `TASKGATE_AGENT_PORT` (9002)
    /// - `TASKGATE_SYNC_WAIT_MS` (30000)
    /// - `TASKGATE_DELEGATE_HEARTBEAT_TIMEOUT_SECS` (90)
    /// - `TASKGATE_REAPER_INTERVAL_SECS` (10)
    /// - `TASKGATE_REBALANCE_INTERVAL_SECS` (60)
    /// - `TASKGATE_REBALANCE_SKEW_THRESHOLD` (2)
    /// - `TASKGATE_BROADCAST_GRACE_MS` (5000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("TASKGATE_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("TASKGATE_DATABASE_URL"))?;

        let service_port: u16 =
            parse_var("TASKGATE_SERVICE_PORT", "9001", "must be a valid port number")?;
        let agent_port: u16 =
            parse_var("TASKGATE_AGENT_PORT", "9002", "must be a valid port number")?;
        if service_port == agent_port {
            return Err(ConfigError::Invalid(
                "TASKGATE_AGENT_PORT",
                "must differ from TASKGATE_SERVICE_PORT",
            ));
        }

        let sync_wait_ms: u64 = parse_var(
            "TASKGATE_SYNC_WAIT_MS",
            "30000",
            "must be a non-negative integer",
        )?;
        let heartbeat_timeout_secs: u64 = parse_var(
            "TASKGATE_DELEGATE_HEARTBEAT_TIMEOUT_SECS",
            "90",
            "must be a positive integer",
        )?;
        if heartbeat_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "TASKGATE_DELEGATE_HEARTBEAT_TIMEOUT_SECS",
                "must be a positive integer",
            ));
        }
        let reaper_interval_secs: u64 = parse_var(
            "TASKGATE_REAPER_INTERVAL_SECS",
            "10",
            "must be a positive integer",
        )?;
        let rebalance_interval_secs: u64 = parse_var(
            "TASKGATE_REBALANCE_INTERVAL_SECS",
            "60",
            "must be a positive integer",
        )?;
        let rebalance_skew_threshold: usize = parse_var(
            "TASKGATE_REBALANCE_SKEW_THRESHOLD",
            "2",
            "must be a non-negative integer",
        )?;
        let broadcast_grace_ms: u64 = parse_var(
            "TASKGATE_BROADCAST_GRACE_MS",
            "5000",
            "must be a non-negative integer",
        )?;

        Ok(Self {
            database_url,
            service_addr: SocketAddr::from(([0, 0, 0, 0], service_port)),
            agent_addr: SocketAddr::from(([0, 0, 0, 0], agent_port)),
            sync_wait: Duration::from_millis(sync_wait_ms),
            delegate_heartbeat_timeout: Duration::from_secs(heartbeat_timeout_secs),
            reaper_interval: Duration::from_secs(reaper_interval_secs.max(1)),
            rebalance_interval: Duration::from_secs(rebalance_interval_secs.max(1)),
            rebalance_skew_threshold,
            broadcast_grace: Duration::from_millis(broadcast_grace_ms),
        })
    }

    /// Dispatcher settings derived from this configuration.
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            sync_wait: self.sync_wait,
            broadcast_grace: self.broadcast_grace,
            delegate_heartbeat_timeout: self.delegate_heartbeat_timeout,
            ..DispatcherConfig::default()
        }
    }

    /// Reaper settings derived from this configuration.
    pub fn reaper_config(&self) -> TaskReaperConfig {
        TaskReaperConfig {
            poll_interval: self.reaper_interval,
            delegate_heartbeat_timeout: self.delegate_heartbeat_timeout,
            ..TaskReaperConfig::default()
        }
    }

    /// Rebalancer settings derived from this configuration.
    pub fn rebalancer_config(&self) -> RebalancerConfig {
        RebalancerConfig {
            poll_interval: self.rebalance_interval,
            skew_threshold: self.rebalance_skew_threshold,
            delegate_heartbeat_timeout: self.delegate_heartbeat_timeout,
        }
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

    // Serializes tests that touch process environment
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ALL_VARS: &[&str] = &[
        "TASKGATE_DATABASE_URL",
        "TASKGATE_SERVICE_PORT",
        "TASKGATE_AGENT_PORT",
        "TASKGATE_SYNC_WAIT_MS",
        "TASKGATE_DELEGATE_HEARTBEAT_TIMEOUT_SECS",
        "TASKGATE_REAPER_INTERVAL_SECS",
        "TASKGATE_REBALANCE_INTERVAL_SECS",
        "TASKGATE_REBALANCE_SKEW_THRESHOLD",
        "TASKGATE_BROADCAST_GRACE_MS",
    ];

    /// Restores touched variables on drop.
    struct EnvGuard {
        saved: Vec<(&'static str, Option<String>)>,
    }

    impl EnvGuard {
        fn clean() -> Self {
            let saved = ALL_VARS.iter().map(|k| (*k, env::var(k).ok())).collect();
            for key in ALL_VARS {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe { env::remove_var(key) };
            }
            Self { saved }
        }

        fn set(&self, key: &str, value: &str) {
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain(..) {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(key, v),
                        None => env::remove_var(key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let guard = EnvGuard::clean();
        guard.set("TASKGATE_DATABASE_URL", "sqlite::memory:");

        let config = Config::from_env().unwrap();
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.service_addr.port(), 9001);
        assert_eq!(config.agent_addr.port(), 9002);
        assert_eq!(config.sync_wait, Duration::from_secs(30));
        assert_eq!(config.delegate_heartbeat_timeout, Duration::from_secs(90));
        assert_eq!(config.reaper_interval, Duration::from_secs(10));
        assert_eq!(config.rebalance_interval, Duration::from_secs(60));
        assert_eq!(config.rebalance_skew_threshold, 2);
        assert_eq!(config.broadcast_grace, Duration::from_millis(5000));
    }

    #[test]
    fn test_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::clean();

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("TASKGATE_DATABASE_URL")));
    }

    #[test]
    fn test_invalid_port() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let guard = EnvGuard::clean();
        guard.set("TASKGATE_DATABASE_URL", "sqlite::memory:");
        guard.set("TASKGATE_SERVICE_PORT", "not-a-port");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("TASKGATE_SERVICE_PORT", _)));
    }

    #[test]
    fn test_ports_must_differ() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let guard = EnvGuard::clean();
        guard.set("TASKGATE_DATABASE_URL", "sqlite::memory:");
        guard.set("TASKGATE_SERVICE_PORT", "7000");
        guard.set("TASKGATE_AGENT_PORT", "7000");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("TASKGATE_AGENT_PORT", _)));
    }

    #[test]
    fn test_zero_heartbeat_timeout_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let guard = EnvGuard::clean();
        guard.set("TASKGATE_DATABASE_URL", "sqlite::memory:");
        guard.set("TASKGATE_DELEGATE_HEARTBEAT_TIMEOUT_SECS", "0");

        assert!(Config::from_env().is_err());
    }

    #[test]
    fn test_derived_worker_configs() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let guard = EnvGuard::clean();
        guard.set("TASKGATE_DATABASE_URL", "postgres://localhost/taskgate");
        guard.set("TASKGATE_SYNC_WAIT_MS", "1500");
        guard.set("TASKGATE_DELEGATE_HEARTBEAT_TIMEOUT_SECS", "45");
        guard.set("TASKGATE_REBALANCE_SKEW_THRESHOLD", "4");

        let config = Config::from_env().unwrap();
        let dispatcher = config.dispatcher_config();
        assert_eq!(dispatcher.sync_wait, Duration::from_millis(1500));
        assert_eq!(dispatcher.delegate_heartbeat_timeout, Duration::from_secs(45));

        let reaper = config.reaper_config();
        assert_eq!(reaper.delegate_heartbeat_timeout, Duration::from_secs(45));

        let rebalancer = config.rebalancer_config();
        assert_eq!(rebalancer.skew_threshold, 4);
        assert_eq!(rebalancer.delegate_heartbeat_timeout, Duration::from_secs(45));
    }
}
