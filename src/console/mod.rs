//! Pylontech battery console client
//!
//! The BMS console has to be woken with a fixed command at 1200 baud before
//! it answers at 115200 baud. Once awake it accepts text commands; the `pwr`
//! report is a whitespace-aligned table without field names in the data rows,
//! so values are picked out by position.

use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::modbus::codec::DecodeError;
use crate::telemetry::{ModuleReading, MODULE_COUNT_RANGE};

pub mod serial;

pub const INIT_BAUD_RATE: u32 = 1200;
pub const OPERATING_BAUD_RATE: u32 = 115_200;

/// Wake-up frame sent at [`INIT_BAUD_RATE`]
pub const INIT_COMMAND: &[u8] = b"~20014682C0048520FCC3\r";
pub const PROBE: &[u8] = b"\r\n";
/// Idle prompt, echoed once per line of the probe
pub const IDLE_BANNER: &[u8] = b"\n\rpylon>\n\rpylon>";
pub const POWER_QUERY: &[u8] = b"pwr\r";

pub const PROBE_READ_LIMIT: usize = 1000;
pub const REPORT_READ_LIMIT: usize = 2200;

// Token layout of the `pwr` report. The header (command echo and column
// titles) is 25 tokens; every module row is 21.
pub const REPORT_BASE: usize = 25;
pub const MODULE_STRIDE: usize = 21;
const INDEX_OFFSET: usize = 0;
const VOLTAGE_OFFSET: usize = 1;
const CURRENT_OFFSET: usize = 2;
const TEMPERATURE_OFFSET: usize = 3;
const BATTERY_STATUS_OFFSET: usize = 8;
const VOLTAGE_STATUS_OFFSET: usize = 9;
const CURRENT_STATUS_OFFSET: usize = 10;
const TEMPERATURE_STATUS_OFFSET: usize = 11;
const SOC_OFFSET: usize = 12;

const TOKEN_PATTERN: &str = r"-?\w+";

/// Hardware timing of the console protocol
#[derive(Debug, Clone, PartialEq)]
pub struct ConsoleTiming {
    /// Wait after the wake-up frame before switching baud rate
    pub handshake_settle: Duration,
    /// Wait between the probe and reading the prompt
    pub probe_settle: Duration,
    /// Wait between the `pwr` query and reading the report
    pub query_settle: Duration,
}

impl Default for ConsoleTiming {
    fn default() -> Self {
        Self {
            handshake_settle: Duration::from_secs(5),
            probe_settle: Duration::from_secs(1),
            query_settle: Duration::from_millis(500),
        }
    }
}

/// Byte-level access to the console port
#[async_trait]
pub trait ConsoleTransport: Send {
    /// (Re)open the port at `baud_rate`, closing any previous handle
    async fn open(&mut self, baud_rate: u32) -> std::io::Result<()>;

    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()>;

    /// Read whatever arrives until `limit` bytes or the line goes quiet
    async fn read_up_to(&mut self, limit: usize) -> std::io::Result<Vec<u8>>;

    async fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleState {
    Uninitialized,
    Initializing,
    Ready,
    Polling,
    Closed,
    Faulted,
}

#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    #[error("console I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake rejected, got {:?} instead of the idle prompt", String::from_utf8_lossy(.reply))]
    HandshakeRejected { reply: Vec<u8> },
    #[error("console is {0:?}, handshake required")]
    NotReady(ConsoleState),
    #[error("unsupported module count {0}, expected 1..=8")]
    UnsupportedModuleCount(usize),
    #[error("power report has {actual} tokens, {needed} needed")]
    ShortReport { needed: usize, actual: usize },
    #[error("power report: {0}")]
    Decode(#[from] DecodeError),
}

/// Client for the battery console
pub struct ConsoleBatteryClient {
    device_id: String,
    transport: Box<dyn ConsoleTransport>,
    timing: ConsoleTiming,
    state: ConsoleState,
}

impl ConsoleBatteryClient {
    pub fn new(
        device_id: impl Into<String>,
        transport: Box<dyn ConsoleTransport>,
        timing: ConsoleTiming,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            transport,
            timing,
            state: ConsoleState::Uninitialized,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn state(&self) -> ConsoleState {
        self.state
    }

    /// Run the full two-phase handshake. Leaves the client `Ready` or `Faulted`.
    pub async fn initialise(&mut self) -> Result<(), ConsoleError> {
        self.state = ConsoleState::Initializing;
        info!("Initialising battery console {}", self.device_id);

        match self.handshake().await {
            Ok(()) => {
                self.state = ConsoleState::Ready;
                info!("Battery console {} ready", self.device_id);
                Ok(())
            }
            Err(e) => {
                self.state = ConsoleState::Faulted;
                warn!("Battery console {} handshake failed: {}", self.device_id, e);
                Err(e)
            }
        }
    }

    async fn handshake(&mut self) -> Result<(), ConsoleError> {
        self.transport.close().await;
        self.transport.open(INIT_BAUD_RATE).await?;
        self.transport.write_all(INIT_COMMAND).await?;
        sleep(self.timing.handshake_settle).await;
        self.transport.close().await;

        self.transport.open(OPERATING_BAUD_RATE).await?;
        let reply = self.probe().await?;
        if reply != IDLE_BANNER {
            return Err(ConsoleError::HandshakeRejected { reply });
        }
        Ok(())
    }

    async fn probe(&mut self) -> Result<Vec<u8>, ConsoleError> {
        self.transport.write_all(PROBE).await?;
        sleep(self.timing.probe_settle).await;
        Ok(self.transport.read_up_to(PROBE_READ_LIMIT).await?)
    }

    /// Liveness probe. Only a `Ready` console can answer.
    pub async fn is_connected(&mut self) -> bool {
        if self.state != ConsoleState::Ready {
            return false;
        }
        match self.probe().await {
            Ok(reply) => reply == IDLE_BANNER,
            Err(e) => {
                debug!("Battery console {} probe failed: {}", self.device_id, e);
                self.state = ConsoleState::Faulted;
                false
            }
        }
    }

    /// Query the power report and extract `module_count` module readings
    pub async fn read_modules(
        &mut self,
        module_count: usize,
    ) -> Result<Vec<ModuleReading>, ConsoleError> {
        if !MODULE_COUNT_RANGE.contains(&module_count) {
            return Err(ConsoleError::UnsupportedModuleCount(module_count));
        }
        if self.state != ConsoleState::Ready {
            return Err(ConsoleError::NotReady(self.state));
        }

        self.state = ConsoleState::Polling;
        let result = match self.query_report().await {
            Ok(report) => parse_power_report(&report, module_count),
            Err(e) => Err(e),
        };
        self.state = match result {
            Ok(_) => ConsoleState::Ready,
            Err(_) => ConsoleState::Faulted,
        };
        result
    }

    async fn query_report(&mut self) -> Result<String, ConsoleError> {
        self.transport.write_all(POWER_QUERY).await?;
        sleep(self.timing.query_settle).await;
        let raw = self.transport.read_up_to(REPORT_READ_LIMIT).await?;
        debug!("{} power report: {} bytes", self.device_id, raw.len());

        String::from_utf8(raw)
            .map_err(|e| ConsoleError::Decode(DecodeError::InvalidUtf8(e.utf8_error())))
    }

    /// Release the port. Idempotent.
    pub async fn close(&mut self) {
        self.transport.close().await;
        if self.state != ConsoleState::Closed {
            debug!("Battery console {} closed", self.device_id);
        }
        self.state = ConsoleState::Closed;
    }
}

/// Split a console report into its positional token stream
pub fn tokenize(report: &str) -> Vec<&str> {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN
        .get_or_init(|| Regex::new(TOKEN_PATTERN).expect("token pattern is valid"))
        .find_iter(report)
        .map(|m| m.as_str())
        .collect()
}

/// Extract module readings from a `pwr` report
pub fn parse_power_report(
    report: &str,
    module_count: usize,
) -> Result<Vec<ModuleReading>, ConsoleError> {
    if !MODULE_COUNT_RANGE.contains(&module_count) {
        return Err(ConsoleError::UnsupportedModuleCount(module_count));
    }

    let tokens = tokenize(report);
    let needed = REPORT_BASE + (module_count - 1) * MODULE_STRIDE + SOC_OFFSET + 1;
    if tokens.len() < needed {
        return Err(ConsoleError::ShortReport {
            needed,
            actual: tokens.len(),
        });
    }

    (0..module_count)
        .map(|i| parse_module(&tokens[REPORT_BASE + i * MODULE_STRIDE..], i + 1))
        .collect()
}

fn parse_module(row: &[&str], module: usize) -> Result<ModuleReading, ConsoleError> {
    let index = integer(row[INDEX_OFFSET], "module index")?;
    if index != module as i64 {
        return Err(malformed(
            "module index",
            format!("expected row {}, found {}", module, index),
        ));
    }

    let soc = integer(row[SOC_OFFSET], "soc")?;
    if !(0..=100).contains(&soc) {
        return Err(malformed("soc", format!("{} outside 0..=100", soc)));
    }

    Ok(ModuleReading {
        module,
        soc: soc as u8,
        voltage: integer(row[VOLTAGE_OFFSET], "voltage")? as f64 / 1000.0,
        current: integer(row[CURRENT_OFFSET], "current")? as f64 / 1000.0,
        temperature: integer(row[TEMPERATURE_OFFSET], "temperature")? as f64 / 1000.0,
        battery_status: row[BATTERY_STATUS_OFFSET].to_string(),
        voltage_status: row[VOLTAGE_STATUS_OFFSET].to_string(),
        current_status: row[CURRENT_STATUS_OFFSET].to_string(),
        temperature_status: row[TEMPERATURE_STATUS_OFFSET].to_string(),
    })
}

fn integer(token: &str, field: &'static str) -> Result<i64, ConsoleError> {
    token
        .parse()
        .map_err(|_| malformed(field, format!("{:?} is not an integer", token)))
}

fn malformed(field: &'static str, reason: String) -> ConsoleError {
    ConsoleError::Decode(DecodeError::Malformed { field, reason })
}
