//! Gateway configuration
//!
//! Loaded once at startup from a YAML file, with a handful of environment
//! overrides for deployment knobs.

use serde::{Deserialize, Serialize};

use crate::utils::error::{GatewayError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub balance: BalanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// Retry orchestration knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Maximum attempts for one logical request, the first included
    #[serde(default = "default_retry_times")]
    pub retry_times: u32,
    /// Per-attempt timeout for non-streaming modes, seconds
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,
    /// Per-attempt timeout for streaming modes, seconds
    #[serde(default = "default_stream_attempt_timeout")]
    pub stream_attempt_timeout_secs: u64,
    /// Overall deadline for one logical request, seconds
    #[serde(default = "default_total_timeout")]
    pub total_timeout_secs: u64,
}

/// Health monitor knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Sliding window over which error rates are computed, seconds
    #[serde(default = "default_monitor_window")]
    pub window_secs: u64,
    /// Outcomes kept per (channel, model)
    #[serde(default = "default_monitor_samples")]
    pub max_samples: usize,
    /// Minimum outcomes before the rate can trigger a ban
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// Windowed error rate at or above which a pair is auto-banned
    #[serde(default = "default_ban_threshold")]
    pub ban_threshold: f64,
    /// Auto-ban duration, seconds
    #[serde(default = "default_ban_duration")]
    pub ban_duration_secs: u64,
    /// Idle records older than this are swept, seconds
    #[serde(default = "default_record_ttl")]
    pub record_ttl_secs: u64,
}

/// Billing backend knobs (the in-process backend only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceConfig {
    /// Balance granted to a group the first time it is seen
    #[serde(default = "default_group_balance")]
    pub default_group_balance: f64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_database_url() -> String {
    "sqlite::memory:".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_retry_times() -> u32 {
    10
}

fn default_attempt_timeout() -> u64 {
    120
}

fn default_stream_attempt_timeout() -> u64 {
    600
}

fn default_total_timeout() -> u64 {
    600
}

fn default_monitor_window() -> u64 {
    300
}

fn default_monitor_samples() -> usize {
    64
}

fn default_min_samples() -> usize {
    8
}

fn default_ban_threshold() -> f64 {
    0.5
}

fn default_ban_duration() -> u64 {
    120
}

fn default_record_ttl() -> u64 {
    3600
}

fn default_group_balance() -> f64 {
    0.0
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            retry_times: default_retry_times(),
            attempt_timeout_secs: default_attempt_timeout(),
            stream_attempt_timeout_secs: default_stream_attempt_timeout(),
            total_timeout_secs: default_total_timeout(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_secs: default_monitor_window(),
            max_samples: default_monitor_samples(),
            min_samples: default_min_samples(),
            ban_threshold: default_ban_threshold(),
            ban_duration_secs: default_ban_duration(),
            record_ttl_secs: default_record_ttl(),
        }
    }
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            default_group_balance: default_group_balance(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            relay: RelayConfig::default(),
            monitor: MonitorConfig::default(),
            balance: BalanceConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file. Missing file falls back to
    /// defaults so the gateway can boot in a bare environment.
    pub fn load(path: &str) -> Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(raw) => serde_yaml::from_str(&raw)
                .map_err(|e| GatewayError::Internal(format!("config parse: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(GatewayError::Internal(format!("config read: {e}"))),
        };

        if let Ok(url) = std::env::var("GATEWAY_DATABASE_URL") {
            config.database.url = url;
        }

        if let Ok(port) = std::env::var("GATEWAY_PORT") {
            config.server.port = port
                .parse()
                .map_err(|_| GatewayError::Internal(format!("invalid GATEWAY_PORT: {port}")))?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.relay.retry_times, 10);
        assert!(config.monitor.ban_threshold > 0.0 && config.monitor.ban_threshold <= 1.0);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let config: Config = serde_yaml::from_str("server:\n  port: 9000\n").unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.relay.retry_times, 10);
    }
}
