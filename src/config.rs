//! Configuration management for SolarBridge

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::console::ConsoleTiming;
use crate::error::ConfigError;
use crate::telemetry::MODULE_COUNT_RANGE;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Pylontech console link
    pub battery: BatteryConfig,
    /// Conext XW+ inverter
    pub inverter: ModbusDeviceConfig,
    /// Conext MPPT charge controllers, polled in list order
    #[serde(default)]
    pub charge_controllers: Vec<ModbusDeviceConfig>,
    /// Conext ComBox gateway, polled after the charge controllers
    #[serde(default)]
    pub combox: Option<ModbusDeviceConfig>,
    /// Cadence, capabilities and the SoC policy
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatteryConfig {
    #[serde(default = "default_battery_id")]
    pub id: String,
    /// Serial port path (e.g., /dev/ttyUSB0)
    pub port: String,
    /// Number of installed modules (1-8)
    pub module_count: usize,
    /// Inter-byte gap that ends a read
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_handshake_settle_ms")]
    pub handshake_settle_ms: u64,
    #[serde(default = "default_probe_settle_ms")]
    pub probe_settle_ms: u64,
    #[serde(default = "default_query_settle_ms")]
    pub query_settle_ms: u64,
    /// Startup liveness probes before giving up
    #[serde(default = "default_startup_probes")]
    pub startup_probes: u32,
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    /// Failed probes after which the handshake is run again, once
    #[serde(default = "default_rehandshake_after")]
    pub rehandshake_after: u32,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl BatteryConfig {
    pub fn timing(&self) -> ConsoleTiming {
        ConsoleTiming {
            handshake_settle: Duration::from_millis(self.handshake_settle_ms),
            probe_settle: Duration::from_millis(self.probe_settle_ms),
            query_settle: Duration::from_millis(self.query_settle_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusDeviceConfig {
    /// Unique device ID
    pub id: String,
    /// Host address
    pub host: String,
    /// Port (default: 502)
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    /// Modbus unit ID
    pub unit_id: u8,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Wait after (re)opening before the first request
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Per-device failure budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Consecutive failures tolerated before a cooldown and reconnect
    #[serde(default = "default_reconnect_after")]
    pub reconnect_after: u32,
    /// Consecutive failures tolerated before the loop aborts
    #[serde(default = "default_abort_after")]
    pub abort_after: u32,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            reconnect_after: default_reconnect_after(),
            abort_after: default_abort_after(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Seconds between poll cycles
    #[serde(default = "default_cadence_secs")]
    pub cadence_secs: u64,
    /// Log per-module SoC each cycle
    #[serde(default = "default_true")]
    pub display: bool,
    /// Hand telemetry to the sink
    #[serde(default = "default_true")]
    pub persist: bool,
    /// Drive the support register from battery SoC
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Percent at or above which support is enabled
    #[serde(default = "default_soc_high")]
    pub soc_high: u8,
    /// Percent at or below which support is disabled
    #[serde(default = "default_soc_low")]
    pub soc_low: u8,
    /// Volts, written once at startup
    #[serde(default = "default_battery_low_cutout")]
    pub battery_low_cutout: f64,
    /// Volts, written once at startup
    #[serde(default = "default_battery_hysteresis")]
    pub battery_hysteresis: f64,
    /// Restored on every exit path
    #[serde(default = "default_safe_cutout")]
    pub safe_cutout: f64,
    #[serde(default = "default_safe_hysteresis")]
    pub safe_hysteresis: f64,
    #[serde(default)]
    pub support_register: SupportRegister,
}

impl ControlConfig {
    pub fn cadence(&self) -> Duration {
        Duration::from_secs(self.cadence_secs)
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            cadence_secs: default_cadence_secs(),
            display: true,
            persist: true,
            enabled: true,
            soc_high: default_soc_high(),
            soc_low: default_soc_low(),
            battery_low_cutout: default_battery_low_cutout(),
            battery_hysteresis: default_battery_hysteresis(),
            safe_cutout: default_safe_cutout(),
            safe_hysteresis: default_safe_hysteresis(),
            support_register: SupportRegister::default(),
        }
    }
}

/// Inverter register toggled by the SoC policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupportRegister {
    #[default]
    GridSupport,
    LoadShave,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Directory for the daily CSV files
    #[serde(default = "default_sink_directory")]
    pub directory: PathBuf,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            directory: default_sink_directory(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub enabled: bool,
    /// MQTT broker host
    pub host: String,
    /// MQTT broker port
    pub port: u16,
    /// Client ID
    pub client_id: String,
    /// Topic prefix
    pub topic_prefix: String,
    /// QoS level (0, 1, or 2)
    pub qos: u8,
    /// Username (optional)
    pub username: Option<String>,
    /// Password (optional)
    pub password: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 1883,
            client_id: "solarbridge".to_string(),
            topic_prefix: "solarbridge".to_string(),
            qos: 1,
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Prometheus scrape endpoint
    #[serde(default = "default_metrics_listen")]
    pub listen: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

fn default_battery_id() -> String {
    "battery".to_string()
}
fn default_read_timeout_ms() -> u64 {
    50
}
fn default_write_timeout_ms() -> u64 {
    1000
}
fn default_handshake_settle_ms() -> u64 {
    5000
}
fn default_probe_settle_ms() -> u64 {
    1000
}
fn default_query_settle_ms() -> u64 {
    500
}
fn default_startup_probes() -> u32 {
    10
}
fn default_probe_interval_ms() -> u64 {
    1000
}
fn default_rehandshake_after() -> u32 {
    5
}
fn default_modbus_port() -> u16 {
    502
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_request_timeout_ms() -> u64 {
    2000
}
fn default_settle_delay_ms() -> u64 {
    1000
}
fn default_reconnect_after() -> u32 {
    3
}
fn default_abort_after() -> u32 {
    10
}
fn default_cooldown_ms() -> u64 {
    5000
}
fn default_cadence_secs() -> u64 {
    30
}
fn default_true() -> bool {
    true
}
fn default_soc_high() -> u8 {
    80
}
fn default_soc_low() -> u8 {
    40
}
fn default_battery_low_cutout() -> f64 {
    45.5
}
fn default_battery_hysteresis() -> f64 {
    2.0
}
fn default_safe_cutout() -> f64 {
    46.5
}
fn default_safe_hysteresis() -> f64 {
    2.5
}
fn default_sink_directory() -> PathBuf {
    PathBuf::from("log")
}
fn default_metrics_listen() -> String {
    "0.0.0.0:9100".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            battery: BatteryConfig {
                id: default_battery_id(),
                port: "/dev/ttyUSB0".to_string(),
                module_count: 6,
                read_timeout_ms: default_read_timeout_ms(),
                write_timeout_ms: default_write_timeout_ms(),
                handshake_settle_ms: default_handshake_settle_ms(),
                probe_settle_ms: default_probe_settle_ms(),
                query_settle_ms: default_query_settle_ms(),
                startup_probes: default_startup_probes(),
                probe_interval_ms: default_probe_interval_ms(),
                rehandshake_after: default_rehandshake_after(),
                retry: RetryConfig::default(),
            },
            inverter: ModbusDeviceConfig {
                id: "inverter".to_string(),
                host: "192.168.0.210".to_string(),
                port: default_modbus_port(),
                unit_id: 10,
                connect_timeout_ms: default_connect_timeout_ms(),
                request_timeout_ms: default_request_timeout_ms(),
                settle_delay_ms: default_settle_delay_ms(),
                retry: RetryConfig::default(),
            },
            charge_controllers: vec![],
            combox: None,
            control: ControlConfig::default(),
            sink: SinkConfig::default(),
            mqtt: MqttConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Reject settings the supervisor cannot run with. Called before any device I/O.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let control = &self.control;
        if control.soc_high > 100 {
            return Err(ConfigError::ThresholdRange(control.soc_high));
        }
        if control.soc_low >= control.soc_high {
            return Err(ConfigError::ThresholdOrder {
                low: control.soc_low,
                high: control.soc_high,
            });
        }
        if control.cadence_secs == 0 {
            return Err(ConfigError::ZeroCadence);
        }

        if self.battery.port.is_empty() {
            return Err(ConfigError::Missing("battery.port"));
        }
        if !MODULE_COUNT_RANGE.contains(&self.battery.module_count) {
            return Err(ConfigError::ModuleCount(self.battery.module_count));
        }
        check_retry(&self.battery.id, &self.battery.retry)?;

        for device in std::iter::once(&self.inverter)
            .chain(&self.charge_controllers)
            .chain(&self.combox)
        {
            if device.host.is_empty() {
                return Err(ConfigError::Missing("host"));
            }
            check_retry(&device.id, &device.retry)?;
        }
        Ok(())
    }
}

fn check_retry(device: &str, retry: &RetryConfig) -> Result<(), ConfigError> {
    if retry.reconnect_after >= retry.abort_after {
        return Err(ConfigError::RetryThresholds {
            device: device.to_string(),
            reconnect_after: retry.reconnect_after,
            abort_after: retry.abort_after,
        });
    }
    Ok(())
}

/// Load configuration from file or use defaults.
///
/// The file is named by `SOLARBRIDGE_CONFIG` (default `config.yaml`).
/// Variables such as `SOLARBRIDGE__CONTROL__SOC_HIGH=85` override file values.
pub fn load_config() -> Result<Config> {
    let config_path =
        std::env::var("SOLARBRIDGE_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());

    if !Path::new(&config_path).exists() {
        tracing::warn!("Config file {} not found, using defaults", config_path);
        return Ok(Config::default());
    }

    let settings = ::config::Config::builder()
        .add_source(::config::File::new(&config_path, ::config::FileFormat::Yaml))
        .add_source(
            ::config::Environment::with_prefix("SOLARBRIDGE")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to read config file: {}", config_path))?;

    settings
        .try_deserialize()
        .with_context(|| format!("Failed to parse config file: {}", config_path))
}

/// Load configuration from a YAML string
pub fn load_config_from_str(yaml: &str) -> Result<Config> {
    serde_yaml::from_str(yaml).with_context(|| "Failed to parse config")
}
