//! # Link Configuration
//!
//! All timing, retry and discovery knobs for the host live in one TOML file. Every
//! section and field is optional; missing values fall back to the defaults below.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [connection]
//! port = "/dev/ttyUSB0"
//! baud = 115200
//! checksums = "auto"
//! command_timeout_ms = 5000
//!
//! [discovery]
//! baud_rates = [250000, 115200]
//!
//! [monitor]
//! poll_interval_ms = 2000
//! failure_threshold = 3
//! auto_reconnect = true
//! ```

// src/config.rs - Single configuration file
use crate::communication::protocol::ExecuteOptions;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
}

/// Whether outbound lines get `N<seq> ... *<checksum>` framing.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumMode {
    /// Follow the identified firmware's capability flag.
    #[default]
    Auto,
    Always,
    Never,
}

impl ChecksumMode {
    pub fn resolve(self, firmware_supports: bool) -> bool {
        match self {
            ChecksumMode::Auto => firmware_supports,
            ChecksumMode::Always => true,
            ChecksumMode::Never => false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub baud: Option<u32>,
    #[serde(default)]
    pub checksums: ChecksumMode,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Boards often reset on open; give the bootloader time before talking.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_identify_timeout_ms")]
    pub identify_timeout_ms: u64,
    #[serde(default = "default_leveling_timeout_ms")]
    pub leveling_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud: None,
            checksums: ChecksumMode::Auto,
            command_timeout_ms: default_command_timeout_ms(),
            max_retries: default_max_retries(),
            settle_ms: default_settle_ms(),
            identify_timeout_ms: default_identify_timeout_ms(),
            leveling_timeout_ms: default_leveling_timeout_ms(),
        }
    }
}

impl ConnectionConfig {
    pub fn command_options(&self) -> ExecuteOptions {
        ExecuteOptions::new(Duration::from_millis(self.command_timeout_ms), self.max_retries)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DiscoveryConfig {
    /// Tried in order; highest first.
    #[serde(default = "default_baud_rates")]
    pub baud_rates: Vec<u32>,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_probe_polls")]
    pub probe_polls: u32,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Probe every enumerated port, not just USB-serial looking ones.
    #[serde(default)]
    pub include_all_ports: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            baud_rates: default_baud_rates(),
            probe_timeout_ms: default_probe_timeout_ms(),
            probe_polls: default_probe_polls(),
            max_workers: default_max_workers(),
            include_all_ports: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MonitorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: default_poll_interval_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            auto_reconnect: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_retry_base_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_retry_base_ms(),
            max_delay_ms: default_retry_max_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self, max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_retries,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.multiplier,
        )
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ReconnectConfig {
    #[serde(default = "default_reconnect_base_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub max_delay_ms: u64,
    /// 0 keeps trying until the connection is closed.
    #[serde(default = "default_reconnect_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_reconnect_base_ms(),
            max_delay_ms: default_reconnect_max_ms(),
            max_attempts: default_reconnect_attempts(),
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            2.0,
        )
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BreakerConfig {
    #[serde(default = "default_breaker_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_breaker_open_ms")]
    pub open_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_breaker_threshold(),
            open_timeout_ms: default_breaker_open_ms(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let c = &self.connection;
        if c.command_timeout_ms == 0 || c.identify_timeout_ms == 0 || c.leveling_timeout_ms == 0 {
            return Err(ConfigError::Invalid("connection timeouts must be > 0".into()));
        }
        if self.discovery.baud_rates.is_empty() {
            return Err(ConfigError::Invalid("discovery.baud_rates must not be empty".into()));
        }
        if self.discovery.baud_rates.contains(&0) {
            return Err(ConfigError::Invalid("discovery.baud_rates contains 0".into()));
        }
        if self.discovery.max_workers == 0 {
            return Err(ConfigError::Invalid("discovery.max_workers must be > 0".into()));
        }
        if self.discovery.probe_timeout_ms == 0 || self.discovery.probe_polls == 0 {
            return Err(ConfigError::Invalid("discovery probe window must be > 0".into()));
        }
        if self.monitor.poll_interval_ms == 0 || self.monitor.poll_timeout_ms == 0 {
            return Err(ConfigError::Invalid("monitor intervals must be > 0".into()));
        }
        if self.monitor.failure_threshold == 0 {
            return Err(ConfigError::Invalid("monitor.failure_threshold must be > 0".into()));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid("retry.multiplier must be >= 1.0".into()));
        }
        if self.reconnect.base_delay_ms > self.reconnect.max_delay_ms {
            return Err(ConfigError::Invalid(
                "reconnect.base_delay_ms exceeds reconnect.max_delay_ms".into(),
            ));
        }
        Ok(())
    }
}

fn default_true() -> bool { true }
fn default_command_timeout_ms() -> u64 { 5000 }
fn default_max_retries() -> u32 { 3 }
fn default_settle_ms() -> u64 { 2000 }
fn default_identify_timeout_ms() -> u64 { 3000 }
fn default_leveling_timeout_ms() -> u64 { 300_000 }
fn default_baud_rates() -> Vec<u32> { vec![250000, 115200, 57600] }
fn default_probe_timeout_ms() -> u64 { 250 }
fn default_probe_polls() -> u32 { 6 }
fn default_max_workers() -> usize { 4 }
fn default_poll_interval_ms() -> u64 { 2000 }
fn default_poll_timeout_ms() -> u64 { 2000 }
fn default_failure_threshold() -> u32 { 3 }
fn default_retry_base_ms() -> u64 { 100 }
fn default_retry_max_ms() -> u64 { 2000 }
fn default_multiplier() -> f64 { 2.0 }
fn default_reconnect_base_ms() -> u64 { 500 }
fn default_reconnect_max_ms() -> u64 { 30_000 }
fn default_reconnect_attempts() -> u32 { 0 }
fn default_breaker_threshold() -> u32 { 5 }
fn default_breaker_open_ms() -> u64 { 10_000 }

/// Load configuration from a TOML file at the given path.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let config: Config = match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                return Err(ConfigError::Toml(e));
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            return Err(ConfigError::Io(e));
        }
    };
    config.validate()?;
    Ok(config)
}
