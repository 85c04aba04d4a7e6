//! Fake devices shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use solarbridge::config::{Config, ModbusDeviceConfig, RetryConfig};
use solarbridge::console::{ConsoleTransport, IDLE_BANNER, POWER_QUERY, PROBE};
use solarbridge::devices::DeviceKind;
use solarbridge::error::{ConnectError, IoError};
use solarbridge::modbus::RegisterDevice;
use solarbridge::sink::{SinkError, TelemetrySink};
use solarbridge::supervisor::{BatteryHandle, DeviceHandle, Supervisor};
use solarbridge::telemetry::TelemetryRecord;

pub const GRID_SUPPORT: u16 = 0x01B3;
pub const LOW_BATTERY_CUT_OUT: u16 = 0x01F2;
pub const BATTERY_HYSTERESIS: u16 = 0x01F6;

/// Observable state of a fake Modbus device
#[derive(Debug, Default)]
pub struct DeviceState {
    pub registers: HashMap<u16, u16>,
    pub writes: Vec<(u16, Vec<u16>)>,
    pub reads: usize,
    pub fail_reads: bool,
    /// Reads past this many fail, without affecting the liveness probe
    pub fail_after: Option<usize>,
    pub fail_writes: bool,
    pub reconnects: u32,
    pub closed: bool,
}

/// Modbus device backed by a register map
#[derive(Clone, Default)]
pub struct FakeDevice(pub Arc<Mutex<DeviceState>>);

impl FakeDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.0.lock().unwrap()
    }

    pub fn set_failing(&self, failing: bool) {
        self.state().fail_reads = failing;
    }

    /// Writes issued to one register, in order
    pub fn writes_to(&self, address: u16) -> Vec<Vec<u16>> {
        self.state()
            .writes
            .iter()
            .filter(|(a, _)| *a == address)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

#[async_trait]
impl RegisterDevice for FakeDevice {
    async fn open(&mut self) -> Result<(), ConnectError> {
        self.state().closed = false;
        Ok(())
    }

    async fn read_registers(&mut self, start: u16, count: u16) -> Result<Vec<u16>, IoError> {
        let mut state = self.state();
        state.reads += 1;
        if state.fail_reads || state.fail_after.map_or(false, |n| state.reads > n) {
            return Err(IoError::Timeout(Duration::from_millis(100)));
        }
        Ok((start..start + count)
            .map(|a| state.registers.get(&a).copied().unwrap_or(0))
            .collect())
    }

    async fn write_registers(&mut self, start: u16, values: &[u16]) -> Result<(), IoError> {
        let mut state = self.state();
        if state.fail_writes {
            return Err(IoError::NotConnected);
        }
        for (i, v) in values.iter().enumerate() {
            state.registers.insert(start + i as u16, *v);
        }
        state.writes.push((start, values.to_vec()));
        Ok(())
    }

    async fn is_connected(&mut self) -> bool {
        !self.state().fail_reads
    }

    async fn reconnect(&mut self) -> Result<(), ConnectError> {
        self.state().reconnects += 1;
        Ok(())
    }

    async fn close(&mut self) {
        self.state().closed = true;
    }
}

/// Observable state of a fake battery console
#[derive(Debug, Default)]
pub struct ConsoleState {
    pub socs: Vec<u8>,
    pub silent: bool,
    pub fail_reads: bool,
    pub written: Vec<Vec<u8>>,
    pub opened_at: Vec<u32>,
    pub closed: bool,
}

/// Battery console that answers like the real BMS
#[derive(Clone, Default)]
pub struct FakeConsole(pub Arc<Mutex<ConsoleState>>);

impl FakeConsole {
    pub fn with_socs(socs: &[u8]) -> Self {
        let console = Self::default();
        console.set_socs(socs);
        console
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, ConsoleState> {
        self.0.lock().unwrap()
    }

    pub fn set_socs(&self, socs: &[u8]) {
        self.state().socs = socs.to_vec();
    }

    pub fn handshakes(&self) -> usize {
        self.state()
            .written
            .iter()
            .filter(|w| w.starts_with(b"~2001"))
            .count()
    }
}

#[async_trait]
impl ConsoleTransport for FakeConsole {
    async fn open(&mut self, baud_rate: u32) -> std::io::Result<()> {
        let mut state = self.state();
        state.opened_at.push(baud_rate);
        state.closed = false;
        Ok(())
    }

    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.state().written.push(bytes.to_vec());
        Ok(())
    }

    async fn read_up_to(&mut self, limit: usize) -> std::io::Result<Vec<u8>> {
        let state = self.state();
        if state.fail_reads {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "no reply",
            ));
        }
        let mut reply = match state.written.last() {
            _ if state.silent => Vec::new(),
            Some(w) if w.as_slice() == PROBE => IDLE_BANNER.to_vec(),
            Some(w) if w.as_slice() == POWER_QUERY => power_report(&state.socs).into_bytes(),
            _ => Vec::new(),
        };
        reply.truncate(limit);
        Ok(reply)
    }

    async fn close(&mut self) {
        self.state().closed = true;
    }
}

/// A `pwr` report as printed by the BMS console
pub fn power_report(socs: &[u8]) -> String {
    let mut out = String::from(
        "pwr\r\n@\r\r\nPower Volt   Curr   Tempr  Tlow   Thigh  Vlow   Vhigh  Base.St  Volt.St  Curr.St  Temp.St  Coulomb  Time                 B.V.St   B.T.St  \r\n",
    );
    for (i, soc) in socs.iter().enumerate() {
        out.push_str(&format!(
            "{}     49890  -1190  25000  23000  24000  3325   3328   Dischg   Normal   Normal   Normal   {}%      2019-03-04 21:41:38  Normal   Normal  \r\n",
            i + 1,
            soc
        ));
    }
    out.push_str("Command completed successfully\r\n$$\r\n\rpylon>");
    out
}

/// Sink that keeps records in memory
#[derive(Clone, Default)]
pub struct MemorySink(pub Arc<Mutex<Vec<TelemetryRecord>>>);

impl MemorySink {
    pub fn device_ids(&self) -> Vec<String> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.device_id().to_string())
            .collect()
    }
}

impl TelemetrySink for MemorySink {
    fn record(&mut self, record: &TelemetryRecord) -> Result<(), SinkError> {
        self.0.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// Sink whose storage is always unavailable
pub struct FailingSink;

impl TelemetrySink for FailingSink {
    fn record(&mut self, _record: &TelemetryRecord) -> Result<(), SinkError> {
        Err(SinkError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "read-only filesystem",
        )))
    }
}

fn instant_retry(reconnect_after: u32, abort_after: u32) -> RetryConfig {
    RetryConfig {
        reconnect_after,
        abort_after,
        cooldown_ms: 0,
    }
}

fn fast_device(id: &str, unit_id: u8) -> ModbusDeviceConfig {
    ModbusDeviceConfig {
        id: id.to_string(),
        host: "127.0.0.1".to_string(),
        port: 502,
        unit_id,
        connect_timeout_ms: 100,
        request_timeout_ms: 100,
        settle_delay_ms: 0,
        retry: instant_retry(3, 10),
    }
}

/// Six modules, one charge controller, no waiting anywhere
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.battery.module_count = 6;
    config.battery.handshake_settle_ms = 0;
    config.battery.probe_settle_ms = 0;
    config.battery.query_settle_ms = 0;
    config.battery.probe_interval_ms = 0;
    config.battery.retry = instant_retry(3, 10);
    config.inverter = fast_device("xw", 10);
    config.charge_controllers = vec![fast_device("mppt-1", 30)];
    config.control.cadence_secs = 1;
    config.control.display = true;
    config
}

pub fn set_retry(config: &mut ModbusDeviceConfig, reconnect_after: u32, abort_after: u32) {
    config.retry = instant_retry(reconnect_after, abort_after);
}

/// Fakes wired into a supervisor
pub struct Rig {
    pub supervisor: Supervisor,
    pub battery: FakeConsole,
    pub inverter: FakeDevice,
    pub charge_controller: FakeDevice,
    pub sink: MemorySink,
}

pub fn rig(config: &Config, socs: &[u8]) -> Rig {
    let battery = FakeConsole::with_socs(socs);
    let inverter = FakeDevice::new();
    let charge_controller = FakeDevice::new();
    let sink = MemorySink::default();

    let supervisor = Supervisor::new(
        config,
        BatteryHandle::new(&config.battery, Box::new(battery.clone())),
        DeviceHandle::new(
            &config.inverter,
            DeviceKind::Inverter,
            Box::new(inverter.clone()),
        ),
        vec![DeviceHandle::new(
            &config.charge_controllers[0],
            DeviceKind::ChargeController,
            Box::new(charge_controller.clone()),
        )],
    )
    .unwrap()
    .with_sink(Box::new(sink.clone()));

    Rig {
        supervisor,
        battery,
        inverter,
        charge_controller,
        sink,
    }
}
