//! Conext XW+ inverter register map (supported subset)

use super::ENABLE_STATES;
use crate::modbus::codec::{EnumTable, FieldDescriptor, Width};
use crate::modbus::{RegisterField, FIRMWARE_VERSION};

pub const INVERTER_STATUS_LABELS: EnumTable = &[
    (1024, "Invert"),
    (1025, "AC Pass Through"),
    (1026, "APS Only"),
    (1027, "Load Sense"),
    (1028, "Inverter Disabled"),
    (1029, "Load Sense Ready"),
    (1030, "Engaging Inverter"),
    (1031, "Invert Fault"),
    (1032, "Inverter Standby"),
    (1033, "Grid-Tied"),
    (1034, "Grid Support"),
    (1035, "Gen Support"),
    (1036, "Sell-to-Grid"),
    (1037, "Load Shaving"),
    (1038, "Grid Frequency Stabilization"),
];

const FAULT_LABELS: EnumTable = &[(0, "No Active Faults"), (1, "Active Faults")];
const WARNING_LABELS: EnumTable = &[(0, "No Active Warnings"), (1, "Active Warnings")];

const fn unsigned(
    name: &'static str,
    address: u16,
    width: Width,
    scale: u32,
    unit: &'static str,
) -> RegisterField {
    RegisterField {
        name,
        address,
        descriptor: FieldDescriptor::ScaledUnsigned { width, scale },
        unit: Some(unit),
    }
}

const fn signed(
    name: &'static str,
    address: u16,
    width: Width,
    scale: u32,
    unit: &'static str,
) -> RegisterField {
    RegisterField {
        name,
        address,
        descriptor: FieldDescriptor::ScaledSigned { width, scale },
        unit: Some(unit),
    }
}

const fn status(name: &'static str, address: u16, labels: EnumTable) -> RegisterField {
    RegisterField {
        name,
        address,
        descriptor: FieldDescriptor::Enum { labels },
        unit: None,
    }
}

pub const ACTIVE_FAULTS: RegisterField = status("active_faults", 0x0052, FAULT_LABELS);
pub const ACTIVE_WARNINGS: RegisterField = status("active_warnings", 0x0053, WARNING_LABELS);
pub const INVERTER_DC_CURRENT: RegisterField =
    signed("inverter_dc_current", 0x0058, Width::W32, 1000, "A");
pub const INVERTER_DC_POWER: RegisterField =
    signed("inverter_dc_power", 0x005A, Width::W32, 1, "W");
pub const GRID_FREQUENCY: RegisterField =
    unsigned("grid_frequency", 0x0061, Width::W16, 100, "Hz");
pub const GRID_VOLTAGE: RegisterField = unsigned("grid_voltage", 0x0062, Width::W32, 1000, "V");
pub const GRID_CURRENT: RegisterField = signed("grid_current", 0x0064, Width::W32, 1000, "A");
pub const GRID_POWER: RegisterField = signed("grid_power", 0x0066, Width::W32, 1, "W");
pub const LOAD_FREQUENCY: RegisterField =
    unsigned("load_frequency", 0x006C, Width::W16, 100, "Hz");
pub const LOAD_VOLTAGE: RegisterField = unsigned("load_voltage", 0x006E, Width::W32, 1000, "V");
pub const LOAD_CURRENT: RegisterField = signed("load_current", 0x0070, Width::W32, 1000, "A");
pub const LOAD_POWER: RegisterField = signed("load_power", 0x0072, Width::W32, 1, "W");
pub const INVERTER_STATUS: RegisterField =
    status("inverter_status", 0x007A, INVERTER_STATUS_LABELS);
pub const ENERGY_GRID_MONTH: RegisterField =
    unsigned("energy_grid_month", 0x00FA, Width::W32, 1000, "kWh");
pub const ENERGY_LOAD_MONTH: RegisterField =
    unsigned("energy_load_month", 0x010A, Width::W32, 1000, "kWh");
pub const ENERGY_BATTERY_MONTH: RegisterField =
    unsigned("energy_battery_month", 0x011A, Width::W32, 1000, "kWh");
pub const LOAD_SHAVE_STATUS: RegisterField =
    status("load_shave_status", 0x01B2, ENABLE_STATES);
pub const GRID_SUPPORT_STATUS: RegisterField =
    status("grid_support_status", 0x01B3, ENABLE_STATES);
pub const LOW_BATTERY_CUT_OUT: RegisterField =
    unsigned("low_battery_cut_out", 0x01F2, Width::W32, 1000, "V");
pub const LOW_BATTERY_CUT_OUT_DELAY: RegisterField =
    unsigned("low_battery_cut_out_delay", 0x01F4, Width::W16, 100, "s");
pub const BATTERY_HYSTERESIS: RegisterField =
    unsigned("battery_hysteresis", 0x01F6, Width::W32, 1000, "V");

/// Fields polled every tick, in snapshot order
pub const TELEMETRY: &[RegisterField] = &[
    FIRMWARE_VERSION,
    GRID_VOLTAGE,
    GRID_CURRENT,
    GRID_POWER,
    GRID_FREQUENCY,
    LOAD_VOLTAGE,
    LOAD_CURRENT,
    LOAD_POWER,
    LOAD_FREQUENCY,
    INVERTER_DC_CURRENT,
    INVERTER_DC_POWER,
    ENERGY_GRID_MONTH,
    ENERGY_LOAD_MONTH,
    ENERGY_BATTERY_MONTH,
    LOW_BATTERY_CUT_OUT,
    LOW_BATTERY_CUT_OUT_DELAY,
    BATTERY_HYSTERESIS,
    INVERTER_STATUS,
    ACTIVE_WARNINGS,
    ACTIVE_FAULTS,
    GRID_SUPPORT_STATUS,
    LOAD_SHAVE_STATUS,
];
