//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! Every section and key is optional; anything missing takes the default below.

use crate::io::transport::{DISTANCE_CHARACTERISTIC_UUID, DISTANCE_SERVICE_UUID};
use anyhow::{bail, Context};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

const DEFAULT_CONFIG_PATH: &str = "config/dev.toml";

/// Upper bounds on configured waits
const MAX_WAIT_MS: u64 = 60_000;
const MAX_BLE_TIMEOUT_MS: u64 = 300_000;
const MAX_BACKOFF_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectMode {
    Bounded,
    Unlimited,
}

/// How many reconnects the supervisor may make over the whole run.
///
/// Unlimited has to be asked for explicitly; the default is one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    Bounded { max_attempts: u32 },
    Unlimited,
}

impl ReconnectPolicy {
    /// Whether another attempt is allowed after `attempts_made` reconnects
    pub fn allows(&self, attempts_made: u32) -> bool {
        match self {
            Self::Bounded { max_attempts } => attempts_made < *max_attempts,
            Self::Unlimited => true,
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::Bounded { max_attempts: 1 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            service_uuid: DISTANCE_SERVICE_UUID,
            characteristic_uuid: DISTANCE_CHARACTERISTIC_UUID,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BleSection {
    pub scan_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Bounded wait per receive poll
    pub receive_timeout_ms: u64,
}

impl Default for BleSection {
    fn default() -> Self {
        Self { scan_timeout_ms: 10_000, connect_timeout_ms: 10_000, receive_timeout_ms: 1000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// BCM pin numbers
    pub led_pin: u32,
    pub buzzer_pin: u32,
    pub idle_poll_ms: u64,
    pub gpio_root: String,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            led_pin: 27,
            buzzer_pin: 17,
            idle_poll_ms: 100,
            gpio_root: "/sys/class/gpio".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub policy: ReconnectMode,
    /// Only read when `policy = "bounded"`
    pub max_attempts: u32,
    pub backoff_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self { policy: ReconnectMode::Bounded, max_attempts: 1, backoff_secs: 5 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Periodic link summary (0 to disable)
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: 30 }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TomlConfig {
    pub sensor: SensorConfig,
    pub ble: BleSection,
    pub alert: AlertConfig,
    pub reconnect: ReconnectConfig,
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    service_uuid: Uuid,
    characteristic_uuid: Uuid,
    scan_timeout_ms: u64,
    connect_timeout_ms: u64,
    receive_timeout_ms: u64,
    led_pin: u32,
    buzzer_pin: u32,
    idle_poll_ms: u64,
    gpio_root: String,
    reconnect_policy: ReconnectPolicy,
    reconnect_backoff_ms: u64,
    metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default")
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: &str) -> Self {
        let reconnect_policy = match toml_config.reconnect.policy {
            ReconnectMode::Bounded => {
                ReconnectPolicy::Bounded { max_attempts: toml_config.reconnect.max_attempts }
            }
            ReconnectMode::Unlimited => ReconnectPolicy::Unlimited,
        };

        Self {
            service_uuid: toml_config.sensor.service_uuid,
            characteristic_uuid: toml_config.sensor.characteristic_uuid,
            scan_timeout_ms: toml_config.ble.scan_timeout_ms,
            connect_timeout_ms: toml_config.ble.connect_timeout_ms,
            receive_timeout_ms: toml_config.ble.receive_timeout_ms,
            led_pin: toml_config.alert.led_pin,
            buzzer_pin: toml_config.alert.buzzer_pin,
            idle_poll_ms: toml_config.alert.idle_poll_ms,
            gpio_root: toml_config.alert.gpio_root,
            reconnect_policy,
            reconnect_backoff_ms: toml_config.reconnect.backoff_secs.saturating_mul(1000),
            metrics_interval_secs: toml_config.metrics.interval_secs,
            config_file: config_file.to_string(),
        }
    }

    /// Determine config file path from the CLI value or environment
    pub fn resolve_config_path(cli_path: Option<&str>) -> String {
        if let Some(path) = cli_path {
            return path.to_string();
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        DEFAULT_CONFIG_PATH.to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        Self::from_toml_str(&content, &path.display().to_string())
            .with_context(|| format!("Failed to load config file {}", path.display()))
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(content: &str, source: &str) -> anyhow::Result<Self> {
        let toml_config: TomlConfig = toml::from_str(content).context("invalid TOML")?;
        let config = Self::from_toml(toml_config, source);
        config.validate()?;
        Ok(config)
    }

    /// Load configuration - tries the TOML file first, falls back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.idle_poll_ms == 0 {
            bail!("alert.idle_poll_ms must be greater than 0");
        }
        if self.receive_timeout_ms == 0 {
            bail!("ble.receive_timeout_ms must be greater than 0");
        }
        if self.idle_poll_ms > MAX_WAIT_MS {
            bail!("alert.idle_poll_ms must be at most {MAX_WAIT_MS}");
        }
        if self.receive_timeout_ms > MAX_WAIT_MS {
            bail!("ble.receive_timeout_ms must be at most {MAX_WAIT_MS}");
        }
        if self.scan_timeout_ms > MAX_BLE_TIMEOUT_MS {
            bail!("ble.scan_timeout_ms must be at most {MAX_BLE_TIMEOUT_MS}");
        }
        if self.connect_timeout_ms > MAX_BLE_TIMEOUT_MS {
            bail!("ble.connect_timeout_ms must be at most {MAX_BLE_TIMEOUT_MS}");
        }
        if self.reconnect_backoff_ms > MAX_BACKOFF_SECS * 1000 {
            bail!("reconnect.backoff_secs must be at most {MAX_BACKOFF_SECS}");
        }
        if self.led_pin == self.buzzer_pin {
            bail!("alert.led_pin and alert.buzzer_pin must differ (both {})", self.led_pin);
        }
        Ok(())
    }

    // Getters for all config fields
    pub fn service_uuid(&self) -> Uuid {
        self.service_uuid
    }

    pub fn characteristic_uuid(&self) -> Uuid {
        self.characteristic_uuid
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn led_pin(&self) -> u32 {
        self.led_pin
    }

    pub fn buzzer_pin(&self) -> u32 {
        self.buzzer_pin
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn gpio_root(&self) -> &str {
        &self.gpio_root
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        self.reconnect_policy
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_uuid(), DISTANCE_SERVICE_UUID);
        assert_eq!(config.characteristic_uuid(), DISTANCE_CHARACTERISTIC_UUID);
        assert_eq!(config.led_pin(), 27);
        assert_eq!(config.buzzer_pin(), 17);
        assert_eq!(config.idle_poll(), Duration::from_millis(100));
        assert_eq!(config.receive_timeout(), Duration::from_secs(1));
        assert_eq!(config.reconnect_backoff(), Duration::from_secs(5));
        assert_eq!(config.reconnect_policy(), ReconnectPolicy::Bounded { max_attempts: 1 });
        assert_eq!(config.gpio_root(), "/sys/class/gpio");
        assert_eq!(config.config_file(), "default");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::from_toml_str("[alert]\nled_pin = 22\n", "inline").unwrap();
        assert_eq!(config.led_pin(), 22);
        assert_eq!(config.buzzer_pin(), 17);
        assert_eq!(config.reconnect_backoff(), Duration::from_secs(5));
    }

    #[test]
    fn test_unlimited_reconnect_must_be_explicit() {
        let config =
            Config::from_toml_str("[reconnect]\npolicy = \"unlimited\"\n", "inline").unwrap();
        assert_eq!(config.reconnect_policy(), ReconnectPolicy::Unlimited);

        let config = Config::from_toml_str("[reconnect]\nmax_attempts = 3\n", "inline").unwrap();
        assert_eq!(config.reconnect_policy(), ReconnectPolicy::Bounded { max_attempts: 3 });
    }

    #[test]
    fn test_reconnect_policy_allows() {
        let once = ReconnectPolicy::default();
        assert!(once.allows(0));
        assert!(!once.allows(1));

        let never = ReconnectPolicy::Bounded { max_attempts: 0 };
        assert!(!never.allows(0));

        assert!(ReconnectPolicy::Unlimited.allows(u32::MAX));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(Config::from_toml_str("[alert]\nidle_poll_ms = 0\n", "inline").is_err());
        assert!(Config::from_toml_str("[ble]\nreceive_timeout_ms = 0\n", "inline").is_err());
        assert!(Config::from_toml_str("[alert]\nled_pin = 17\n", "inline").is_err());
        assert!(Config::from_toml_str("[reconnect]\npolicy = \"forever\"\n", "inline").is_err());
    }

    #[test]
    fn test_validation_caps_waits() {
        let huge_poll = format!("[alert]\nidle_poll_ms = {}\n", i64::MAX);
        let err = Config::from_toml_str(&huge_poll, "inline").unwrap_err();
        assert!(err.to_string().contains("idle_poll_ms"));

        let huge_backoff = format!("[reconnect]\nbackoff_secs = {}\n", i64::MAX);
        assert!(Config::from_toml_str(&huge_backoff, "inline").is_err());

        assert!(Config::from_toml_str("[ble]\nreceive_timeout_ms = 60001\n", "inline").is_err());
        assert!(Config::from_toml_str("[ble]\nscan_timeout_ms = 300001\n", "inline").is_err());
        assert!(Config::from_toml_str("[alert]\nidle_poll_ms = 60000\n", "inline").is_ok());
    }

    #[test]
    fn test_resolve_config_path_from_cli() {
        assert_eq!(Config::resolve_config_path(Some("config/garage.toml")), "config/garage.toml");
    }
}
