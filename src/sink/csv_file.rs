//! Daily CSV files, one per device

use chrono::SecondsFormat;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use tracing::{debug, info};

use super::{SinkError, TelemetrySink};
use crate::telemetry::{BatteryTelemetry, DeviceSnapshot, TelemetryRecord};

const BATTERY_HEADER: &[&str] = &[
    "timestamp",
    "module",
    "soc",
    "voltage",
    "current",
    "temperature",
    "battery_status",
    "voltage_status",
    "current_status",
    "temperature_status",
];

/// Appends records to `<directory>/YYYY-MM-DD_<device>.csv`, writing a
/// header row when the file is created
pub struct CsvSink {
    directory: PathBuf,
}

impl CsvSink {
    pub fn new(directory: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;
        info!("Logging telemetry to {}", directory.display());
        Ok(Self { directory })
    }

    /// File for the record's device on the record's (UTC) day
    pub fn path_for(&self, record: &TelemetryRecord) -> PathBuf {
        self.directory.join(format!(
            "{}_{}.csv",
            record.timestamp().format("%Y-%m-%d"),
            record.device_id()
        ))
    }
}

impl TelemetrySink for CsvSink {
    fn record(&mut self, record: &TelemetryRecord) -> Result<(), SinkError> {
        let path = self.path_for(record);
        let is_new = !path.exists();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        match record {
            TelemetryRecord::Battery(battery) => write_battery(&mut writer, battery, is_new)?,
            TelemetryRecord::Device(snapshot) => write_snapshot(&mut writer, snapshot, is_new)?,
        }
        writer.flush()?;

        debug!("Appended {} telemetry to {}", record.device_id(), path.display());
        Ok(())
    }
}

fn write_battery<W: std::io::Write>(
    writer: &mut csv::Writer<W>,
    battery: &BatteryTelemetry,
    header: bool,
) -> Result<(), SinkError> {
    if header {
        writer.write_record(BATTERY_HEADER)?;
    }
    let ts = battery.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true);
    for m in &battery.modules {
        writer.write_record([
            ts.clone(),
            m.module.to_string(),
            m.soc.to_string(),
            m.voltage.to_string(),
            m.current.to_string(),
            m.temperature.to_string(),
            m.battery_status.clone(),
            m.voltage_status.clone(),
            m.current_status.clone(),
            m.temperature_status.clone(),
        ])?;
    }
    Ok(())
}

fn write_snapshot<W: std::io::Write>(
    writer: &mut csv::Writer<W>,
    snapshot: &DeviceSnapshot,
    header: bool,
) -> Result<(), SinkError> {
    if header {
        writer.write_record(
            std::iter::once("timestamp").chain(snapshot.values.iter().map(|(name, _)| *name)),
        )?;
    }
    writer.write_record(
        std::iter::once(snapshot.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true))
            .chain(snapshot.values.iter().map(|(_, value)| value.to_string())),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::DeviceKind;
    use crate::modbus::codec::{EnumValue, RegisterValue};
    use crate::telemetry::{aggregate, ModuleReading};
    use chrono::{TimeZone, Utc};

    fn battery_record(socs: &[u8]) -> TelemetryRecord {
        let modules: Vec<ModuleReading> = socs
            .iter()
            .enumerate()
            .map(|(i, soc)| ModuleReading {
                module: i + 1,
                soc: *soc,
                voltage: 49.89,
                current: -1.19,
                temperature: 25.0,
                battery_status: "Dischg".to_string(),
                voltage_status: "Normal".to_string(),
                current_status: "Normal".to_string(),
                temperature_status: "Normal".to_string(),
            })
            .collect();
        TelemetryRecord::Battery(BatteryTelemetry {
            device_id: "battery".to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
            summary: aggregate(&modules).unwrap(),
            modules,
        })
    }

    #[test]
    fn test_battery_rows_share_one_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvSink::new(dir.path()).unwrap();

        sink.record(&battery_record(&[80, 79])).unwrap();
        sink.record(&battery_record(&[81, 80])).unwrap();

        let path = dir.path().join("2024-06-01_battery.csv");
        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();

        assert_eq!(lines.len(), 5);
        assert!(lines[0].starts_with("timestamp,module,soc"));
        assert_eq!(
            lines[1],
            "2024-06-01T12:00:00Z,1,80,49.89,-1.19,25,Dischg,Normal,Normal,Normal"
        );
        assert!(lines[4].starts_with("2024-06-01T12:00:00Z,2,80,"));
    }

    #[test]
    fn test_device_snapshot_columns_follow_table() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvSink::new(dir.path().join("nested")).unwrap();

        let record = TelemetryRecord::Device(DeviceSnapshot {
            device_id: "xw".to_string(),
            kind: DeviceKind::Inverter,
            timestamp: Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 1).unwrap(),
            values: vec![
                ("grid_voltage", RegisterValue::Number(230.5)),
                ("firmware_version", RegisterValue::Text("02.04".to_string())),
                (
                    "inverter_status",
                    RegisterValue::Enum(EnumValue {
                        code: 1034,
                        label: Some("Grid Support"),
                    }),
                ),
            ],
        });
        sink.record(&record).unwrap();

        let path = sink.path_for(&record);
        assert!(path.ends_with("2024-06-02_xw.csv"));
        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "timestamp,grid_voltage,firmware_version,inverter_status");
        assert_eq!(lines[1], "2024-06-02T00:00:01Z,230.5,02.04,Grid Support");
    }

    #[test]
    fn test_days_get_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvSink::new(dir.path()).unwrap();

        let mut record = battery_record(&[50]);
        sink.record(&record).unwrap();
        if let TelemetryRecord::Battery(b) = &mut record {
            b.timestamp = Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap();
        }
        sink.record(&record).unwrap();

        assert!(dir.path().join("2024-06-01_battery.csv").exists());
        assert!(dir.path().join("2024-06-02_battery.csv").exists());
    }
}
