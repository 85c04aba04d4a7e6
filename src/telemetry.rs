//! Telemetry records and battery aggregation

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::devices::DeviceKind;
use crate::modbus::codec::RegisterValue;

/// Supported battery module counts
pub const MODULE_COUNT_RANGE: std::ops::RangeInclusive<usize> = 1..=8;

/// One battery module's reading from a single poll
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleReading {
    /// 1-based position in the stack
    pub module: usize,
    /// State of charge in percent
    pub soc: u8,
    /// Volts
    pub voltage: f64,
    /// Amps, negative while discharging
    pub current: f64,
    /// Degrees Celsius
    pub temperature: f64,
    pub battery_status: String,
    pub voltage_status: String,
    pub current_status: String,
    pub temperature_status: String,
}

impl ModuleReading {
    /// Check the reading is physically plausible before it reaches the control policy
    pub fn validate(&self) -> Result<(), AggregateError> {
        if self.soc > 100 {
            return Err(AggregateError::Fault {
                module: self.module,
                reason: format!("SoC {} outside 0..=100", self.soc),
            });
        }
        for (name, value) in [
            ("voltage", self.voltage),
            ("current", self.current),
            ("temperature", self.temperature),
        ] {
            if !value.is_finite() {
                return Err(AggregateError::Fault {
                    module: self.module,
                    reason: format!("{} is not a number", name),
                });
            }
        }
        Ok(())
    }
}

/// Fleet-wide view of the battery stack
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetSummary {
    pub module_count: usize,
    /// Exact mean of module SoC; the control policy compares against this
    pub mean_soc: f64,
    /// `mean_soc` rounded half away from zero, for reporting
    pub average_soc: u8,
    pub average_voltage: f64,
    pub total_current: f64,
    pub max_temperature: f64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AggregateError {
    #[error("unsupported module count {0}, expected 1..=8")]
    UnsupportedModuleCount(usize),
    #[error("module {module} reading is faulty: {reason}")]
    Fault { module: usize, reason: String },
}

/// Combine per-module readings into one summary
pub fn aggregate(readings: &[ModuleReading]) -> Result<FleetSummary, AggregateError> {
    let count = readings.len();
    if !MODULE_COUNT_RANGE.contains(&count) {
        return Err(AggregateError::UnsupportedModuleCount(count));
    }
    for reading in readings {
        reading.validate()?;
    }

    let n = count as f64;
    let soc_sum: u32 = readings.iter().map(|r| r.soc as u32).sum();
    let mean_soc = soc_sum as f64 / n;

    Ok(FleetSummary {
        module_count: count,
        mean_soc,
        average_soc: mean_soc.round() as u8,
        average_voltage: readings.iter().map(|r| r.voltage).sum::<f64>() / n,
        total_current: readings.iter().map(|r| r.current).sum(),
        max_temperature: readings
            .iter()
            .map(|r| r.temperature)
            .fold(f64::MIN, f64::max),
    })
}

/// Named register values from one device poll
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub kind: DeviceKind,
    pub timestamp: DateTime<Utc>,
    pub values: Vec<(&'static str, RegisterValue)>,
}

impl DeviceSnapshot {
    pub fn get(&self, name: &str) -> Option<&RegisterValue> {
        self.values
            .iter()
            .find(|(field, _)| *field == name)
            .map(|(_, value)| value)
    }
}

/// Battery poll result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatteryTelemetry {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub modules: Vec<ModuleReading>,
    pub summary: FleetSummary,
}

/// Everything handed to sinks and the publisher
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryRecord {
    Battery(BatteryTelemetry),
    Device(DeviceSnapshot),
}

impl TelemetryRecord {
    pub fn device_id(&self) -> &str {
        match self {
            TelemetryRecord::Battery(b) => &b.device_id,
            TelemetryRecord::Device(d) => &d.device_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            TelemetryRecord::Battery(b) => b.timestamp,
            TelemetryRecord::Device(d) => d.timestamp,
        }
    }
}
