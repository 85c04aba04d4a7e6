//! Static register tables for the supported power-electronics devices

use serde::Serialize;

use crate::modbus::RegisterField;

pub mod combox;
pub mod mppt;
pub mod xw;

/// Device class, which selects the register table and retry thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Battery,
    Inverter,
    ChargeController,
    ComBox,
}

impl DeviceKind {
    /// Telemetry table polled every tick. The battery has no register table.
    pub fn telemetry_table(self) -> &'static [RegisterField] {
        match self {
            DeviceKind::Battery => &[],
            DeviceKind::Inverter => xw::TELEMETRY,
            DeviceKind::ChargeController => mppt::TELEMETRY,
            DeviceKind::ComBox => combox::TELEMETRY,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Battery => "battery",
            DeviceKind::Inverter => "inverter",
            DeviceKind::ChargeController => "charge_controller",
            DeviceKind::ComBox => "combox",
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared two-state table used by the enable/disable registers
pub const ENABLE_STATES: &[(u16, &str)] = &[(0, "Disable"), (1, "Enable")];
