//! Conext MPPT 60 150 charge controller register map (supported subset)

use crate::modbus::codec::{EnumTable, FieldDescriptor, Width};
use crate::modbus::{RegisterField, FIRMWARE_VERSION};

pub const CHARGER_STATUS_LABELS: EnumTable = &[
    (768, "Not Charging"),
    (769, "Bulk"),
    (770, "Absorption"),
    (771, "Overcharge"),
    (772, "Equalize"),
    (773, "Float"),
    (774, "No Float"),
    (775, "Constant VI"),
    (776, "Charger Disabled"),
    (777, "Qualifying AC"),
    (778, "Qualifying APS"),
    (779, "Engaging Charger"),
    (780, "Charge Fault"),
    (781, "Charger Suspend"),
    (782, "AC Good"),
    (783, "APS Good"),
    (784, "AC Fault"),
    (785, "Charge"),
    (786, "Absorption Exit Pending"),
    (787, "Ground Fault"),
    (788, "AC Good Pending"),
];

const DEVICE_STATE_LABELS: EnumTable = &[
    (0, "Hibernate"),
    (1, "Power Save"),
    (2, "Safe Mode"),
    (3, "Operating"),
    (4, "Diagnostic Mode"),
    (5, "Remote Power Off"),
    (255, "Data Not Available"),
];

const FAULT_LABELS: EnumTable = &[(0, "No Active Faults"), (1, "Active Faults")];
const WARNING_LABELS: EnumTable = &[(0, "No Active Warnings"), (1, "Active Warnings")];

const fn scaled(
    name: &'static str,
    address: u16,
    signed: bool,
    scale: u32,
    unit: &'static str,
) -> RegisterField {
    let descriptor = if signed {
        FieldDescriptor::ScaledSigned {
            width: Width::W32,
            scale,
        }
    } else {
        FieldDescriptor::ScaledUnsigned {
            width: Width::W32,
            scale,
        }
    };
    RegisterField {
        name,
        address,
        descriptor,
        unit: Some(unit),
    }
}

pub const MPPT_STATUS: RegisterField = RegisterField {
    name: "mppt_status",
    address: 0x0040,
    descriptor: FieldDescriptor::Enum {
        labels: DEVICE_STATE_LABELS,
    },
    unit: None,
};
pub const CHARGER_STATUS: RegisterField = RegisterField {
    name: "charger_status",
    address: 0x0049,
    descriptor: FieldDescriptor::Enum {
        labels: CHARGER_STATUS_LABELS,
    },
    unit: None,
};
pub const ACTIVE_FAULTS: RegisterField = RegisterField {
    name: "active_faults",
    address: 0x004A,
    descriptor: FieldDescriptor::Enum {
        labels: FAULT_LABELS,
    },
    unit: None,
};
pub const ACTIVE_WARNINGS: RegisterField = RegisterField {
    name: "active_warnings",
    address: 0x004B,
    descriptor: FieldDescriptor::Enum {
        labels: WARNING_LABELS,
    },
    unit: None,
};
pub const DC_INPUT_VOLTAGE: RegisterField = scaled("dc_input_voltage", 0x004C, false, 1000, "V");
pub const DC_INPUT_CURRENT: RegisterField = scaled("dc_input_current", 0x004E, true, 1000, "A");
pub const DC_INPUT_POWER: RegisterField = scaled("dc_input_power", 0x0050, false, 1, "W");
pub const DC_OUTPUT_VOLTAGE: RegisterField = scaled("dc_output_voltage", 0x0058, false, 1000, "V");
pub const DC_OUTPUT_CURRENT: RegisterField = scaled("dc_output_current", 0x005A, true, 1000, "A");
pub const DC_OUTPUT_POWER: RegisterField = scaled("dc_output_power", 0x005C, false, 1, "W");
pub const DC_OUTPUT_POWER_PERCENTAGE: RegisterField = RegisterField {
    name: "dc_output_power_percentage",
    address: 0x005E,
    descriptor: FieldDescriptor::ScaledUnsigned {
        width: Width::W16,
        scale: 100,
    },
    unit: Some("%"),
};
pub const ENERGY_PV_DAY: RegisterField = scaled("energy_pv_day", 0x0090, false, 1000, "kWh");
pub const ENERGY_PV_WEEK: RegisterField = scaled("energy_pv_week", 0x0092, false, 1000, "kWh");
pub const ENERGY_PV_MONTH: RegisterField = scaled("energy_pv_month", 0x0094, false, 1000, "kWh");
pub const ENERGY_PV_YEAR: RegisterField = scaled("energy_pv_year", 0x0096, false, 1000, "kWh");

/// Fields polled every tick, in snapshot order
pub const TELEMETRY: &[RegisterField] = &[
    FIRMWARE_VERSION,
    DC_INPUT_VOLTAGE,
    DC_INPUT_CURRENT,
    DC_INPUT_POWER,
    DC_OUTPUT_VOLTAGE,
    DC_OUTPUT_CURRENT,
    DC_OUTPUT_POWER,
    DC_OUTPUT_POWER_PERCENTAGE,
    ENERGY_PV_DAY,
    ENERGY_PV_WEEK,
    ENERGY_PV_MONTH,
    ENERGY_PV_YEAR,
    MPPT_STATUS,
    CHARGER_STATUS,
    ACTIVE_WARNINGS,
    ACTIVE_FAULTS,
];
