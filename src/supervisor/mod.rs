//! The control loop
//!
//! One task owns every device handle and drives them on a fixed cadence:
//! battery first, then the inverter, then each charge controller and the
//! ComBox. A failing
//! device only affects itself until its retry budget runs out.

use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::console::serial::SerialConsole;
use crate::console::ConsoleError;
use crate::control::{ControlError, ControlOutcome, ControlPolicy, ControlState, SupportState};
use crate::devices::{xw, DeviceKind};
use crate::error::{ConfigError, ConnectError, IoError};
use crate::metrics::{self, PollMetrics};
use crate::modbus::{read_table, FieldError, ModbusClient};
use crate::sink::{CsvSink, SinkError, TelemetrySink};
use crate::telemetry::{
    aggregate, AggregateError, BatteryTelemetry, DeviceSnapshot, FleetSummary, TelemetryRecord,
};

mod handle;

pub use handle::{
    BatteryHandle, DeviceHandle, RetryAction, RetryPolicy, RetryState, StartupProbe,
};

/// Records buffered per publisher subscriber before the oldest are dropped
pub const TELEMETRY_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Connecting,
    Running,
    ShuttingDown,
    Stopped,
    Faulted,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("{device} failed to connect: {source}")]
    Startup {
        device: String,
        #[source]
        source: ConnectError,
    },
    #[error("control initialisation failed: {0}")]
    ControlInit(#[source] ControlError),
    #[error("{device} exceeded its retry budget ({failures} consecutive failures, limit {threshold})")]
    RetryBudgetExhausted {
        device: String,
        failures: u32,
        threshold: u32,
    },
    #[error("telemetry sink: {0}")]
    Sink(#[from] SinkError),
}

#[derive(Debug, thiserror::Error)]
enum BatteryError {
    #[error(transparent)]
    Console(#[from] ConsoleError),
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

/// What happened during one cadence tick
#[derive(Debug, Default)]
pub struct TickReport {
    pub battery: Option<FleetSummary>,
    /// SoC of each module, in stack order
    pub module_socs: Vec<u8>,
    pub snapshots: Vec<DeviceSnapshot>,
    /// Devices whose poll failed this tick
    pub failed: Vec<String>,
    pub control: Option<ControlOutcome>,
    /// Shutdown was observed part way through the tick
    pub cancelled: bool,
}

/// Per-tick capabilities
#[derive(Debug, Clone, Copy)]
struct Capabilities {
    display: bool,
    persist: bool,
    control: bool,
}

type SharedSink = Arc<Mutex<Box<dyn TelemetrySink>>>;

pub struct Supervisor {
    battery: BatteryHandle,
    inverter: DeviceHandle,
    peripherals: Vec<DeviceHandle>,
    control: ControlPolicy,
    capabilities: Capabilities,
    cadence: Duration,
    sink: Option<SharedSink>,
    publisher: broadcast::Sender<TelemetryRecord>,
    state: SupervisorState,
}

impl Supervisor {
    /// Assemble a supervisor from already built handles. Validates the
    /// configuration; no device I/O happens here.
    pub fn new(
        config: &Config,
        battery: BatteryHandle,
        inverter: DeviceHandle,
        peripherals: Vec<DeviceHandle>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        // battery limits and safe defaults are written even when SoC control is off
        let control = ControlPolicy::new(&config.control)?;
        let (publisher, _) = broadcast::channel(TELEMETRY_CHANNEL_CAPACITY);

        Ok(Self {
            battery,
            inverter,
            peripherals,
            control,
            capabilities: Capabilities {
                display: config.control.display,
                persist: config.control.persist,
                control: config.control.enabled,
            },
            cadence: config.control.cadence(),
            sink: None,
            publisher,
            state: SupervisorState::Idle,
        })
    }

    /// Build the real serial and Modbus clients from configuration
    pub fn from_config(config: &Config) -> Result<Self, SupervisorError> {
        config.validate()?;

        let battery = BatteryHandle::new(
            &config.battery,
            Box::new(SerialConsole::new(
                config.battery.port.clone(),
                Duration::from_millis(config.battery.read_timeout_ms),
                Duration::from_millis(config.battery.write_timeout_ms),
            )),
        );
        let inverter = DeviceHandle::new(
            &config.inverter,
            DeviceKind::Inverter,
            Box::new(ModbusClient::new(&config.inverter)),
        );
        let mut peripherals: Vec<DeviceHandle> = config
            .charge_controllers
            .iter()
            .map(|c| {
                DeviceHandle::new(
                    c,
                    DeviceKind::ChargeController,
                    Box::new(ModbusClient::new(c)),
                )
            })
            .collect();
        if let Some(combox) = &config.combox {
            peripherals.push(DeviceHandle::new(
                combox,
                DeviceKind::ComBox,
                Box::new(ModbusClient::new(combox)),
            ));
        }

        let mut supervisor = Self::new(config, battery, inverter, peripherals)?;
        if config.control.persist {
            let sink: Box<dyn TelemetrySink> = Box::new(CsvSink::new(&config.sink.directory)?);
            supervisor.sink = Some(Arc::new(Mutex::new(sink)));
        }
        Ok(supervisor)
    }

    pub fn with_sink(mut self, sink: Box<dyn TelemetrySink>) -> Self {
        self.sink = Some(Arc::new(Mutex::new(sink)));
        self
    }

    /// Receive a copy of every telemetry record. Slow receivers skip records.
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryRecord> {
        self.publisher.subscribe()
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn control_state(&self) -> &ControlState {
        self.control.state()
    }

    /// Consecutive failures recorded for a device
    pub fn retry_count(&self, device_id: &str) -> Option<u32> {
        if self.battery.id() == device_id {
            return Some(self.battery.retry.count());
        }
        std::iter::once(&self.inverter)
            .chain(&self.peripherals)
            .find(|h| h.id == device_id)
            .map(|h| h.retry.count())
    }

    /// Connect, then tick until shutdown is signalled or a fatal error
    /// occurs. Safe defaults are restored on every exit path.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), SupervisorError> {
        let result = self.run_until_stopped(&mut shutdown).await;
        if let Err(e) = &result {
            error!("Supervisor stopping: {}", e);
        }

        self.shutdown().await;
        self.state = match &result {
            Ok(()) => SupervisorState::Stopped,
            Err(_) => SupervisorState::Faulted,
        };
        result
    }

    async fn run_until_stopped(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), SupervisorError> {
        self.connect().await?;

        let mut ticker = interval(self.cadence);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Polling every {:?}", self.cadence);

        loop {
            if *shutdown.borrow() {
                info!("Shutdown requested");
                return Ok(());
            }
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!("Shutdown channel closed");
                        return Ok(());
                    }
                    continue;
                }
            }
            self.tick(shutdown).await?;
        }
    }

    /// Open every device in order and run the one-time control setup
    pub async fn connect(&mut self) -> Result<(), SupervisorError> {
        self.state = SupervisorState::Connecting;

        connect_battery(&mut self.battery).await?;
        connect_device(&mut self.inverter).await?;
        for handle in &mut self.peripherals {
            connect_device(handle).await?;
        }

        let inverter = self.inverter.device.as_mut();
        let setup = if self.capabilities.control {
            self.control.initialise(inverter).await
        } else {
            self.control.apply_battery_limits(inverter).await
        };
        setup.map_err(SupervisorError::ControlInit)?;

        self.state = SupervisorState::Running;
        info!(
            "All devices connected: battery, inverter, {} peripheral device(s)",
            self.peripherals.len()
        );
        Ok(())
    }

    /// One cadence tick. Shutdown is checked after every device.
    ///
    /// The inverter's retry state is only cleared once both its telemetry
    /// poll and the control pass of the same tick have succeeded.
    pub async fn tick(&mut self, shutdown: &watch::Receiver<bool>) -> Result<TickReport, SupervisorError> {
        let started = Instant::now();
        let mut report = TickReport::default();

        match poll_battery(&mut self.battery).await {
            Ok(telemetry) => {
                let failures = self.battery.retry.count();
                if failures > 0 {
                    info!(device = %self.battery.id(), "Recovered after {} failure(s)", failures);
                }
                self.battery.retry.reset();
                metrics::record_retry_count(self.battery.id(), 0);
                report.module_socs = telemetry.modules.iter().map(|m| m.soc).collect();
                metrics::record_battery_soc(telemetry.summary.mean_soc, &report.module_socs);
                report.battery = Some(telemetry.summary.clone());
                self.emit(TelemetryRecord::Battery(telemetry)).await;
            }
            Err(e) => {
                report.failed.push(self.battery.id().to_string());
                battery_failure(&mut self.battery, &e).await?;
            }
        }
        if cancelled(shutdown) {
            return Ok(self.cancel(report, false));
        }

        let inverter_ok = match poll_device(&mut self.inverter).await {
            Ok(snapshot) => {
                report.snapshots.push(snapshot.clone());
                self.emit(TelemetryRecord::Device(snapshot)).await;
                true
            }
            Err(e) => {
                report.failed.push(self.inverter.id.clone());
                device_failure(&mut self.inverter, &e).await?;
                false
            }
        };
        if cancelled(shutdown) {
            return Ok(self.cancel(report, inverter_ok));
        }

        for i in 0..self.peripherals.len() {
            match poll_device(&mut self.peripherals[i]).await {
                Ok(snapshot) => {
                    device_success(&mut self.peripherals[i]);
                    report.snapshots.push(snapshot.clone());
                    self.emit(TelemetryRecord::Device(snapshot)).await;
                }
                Err(e) => {
                    report.failed.push(self.peripherals[i].id.clone());
                    device_failure(&mut self.peripherals[i], &e).await?;
                }
            }
            if cancelled(shutdown) {
                return Ok(self.cancel(report, inverter_ok));
            }
        }

        if self.capabilities.display {
            self.display(&report);
        }

        let mut control_failed = false;
        if let (true, Some(summary)) = (self.capabilities.control, &report.battery) {
            if inverter_ok {
                match self.control.apply(self.inverter.device.as_mut(), summary.mean_soc).await {
                    Ok(outcome) => {
                        metrics::record_support_state(outcome.state == SupportState::Enabled);
                        metrics::record_control_writes(outcome.writes);
                        report.control = Some(outcome);
                    }
                    Err(e) => {
                        control_failed = true;
                        report.failed.push(self.inverter.id.clone());
                        device_failure(&mut self.inverter, &e).await?;
                    }
                }
            } else {
                debug!("Inverter unavailable this tick, control skipped");
            }
        }
        if inverter_ok && !control_failed {
            device_success(&mut self.inverter);
        }

        metrics::record_poll_cycle(started.elapsed());
        Ok(report)
    }

    fn cancel(&mut self, mut report: TickReport, inverter_ok: bool) -> TickReport {
        if inverter_ok {
            device_success(&mut self.inverter);
        }
        report.cancelled = true;
        report
    }

    /// Restore safe defaults (best effort) and release every handle
    pub async fn shutdown(&mut self) {
        self.state = SupervisorState::ShuttingDown;

        let inverter = &mut self.inverter;
        if !inverter.device.is_connected().await {
            if let Err(e) = inverter.device.reconnect().await {
                warn!(device = %inverter.id, "Reconnect before restore failed: {}", e);
            }
        }
        if let Err(e) = self.control.restore_safe_defaults(inverter.device.as_mut()).await {
            error!(device = %inverter.id, "Safe default restoration failed: {}", e);
        }

        self.battery.client.close().await;
        self.inverter.device.close().await;
        for handle in &mut self.peripherals {
            handle.device.close().await;
        }
        info!("All device handles released");
    }

    async fn emit(&mut self, record: TelemetryRecord) {
        if self.capabilities.persist {
            if let Some(sink) = &self.sink {
                persist(Arc::clone(sink), record.clone()).await;
            }
        }
        // no subscribers is fine
        let _ = self.publisher.send(record);
    }

    fn display(&self, report: &TickReport) {
        let Some(summary) = &report.battery else {
            return;
        };
        let status = report
            .snapshots
            .iter()
            .find(|s| s.kind == DeviceKind::Inverter)
            .and_then(|s| s.get(xw::INVERTER_STATUS.name))
            .map(|v| v.to_string())
            .unwrap_or_else(|| "n/a".to_string());

        info!("{}", status_line(&report.module_socs, summary, &status));
    }
}

/// Per-module SoC, the mean the policy acts on, and the inverter status
fn status_line(socs: &[u8], summary: &FleetSummary, status: &str) -> String {
    format!("{} avg:{:.1} {}", module_line(socs), summary.mean_soc, status)
}

/// Sinks write to disk, so the write runs on the blocking pool
async fn persist(sink: SharedSink, record: TelemetryRecord) {
    let device_id = record.device_id().to_string();
    let result = tokio::task::spawn_blocking(move || {
        let mut sink = sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        sink.record(&record)
    })
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(device = %device_id, "Failed to persist telemetry: {}", e),
        Err(e) => warn!(device = %device_id, "Telemetry sink task failed: {}", e),
    }
}

fn module_line(socs: &[u8]) -> String {
    socs.iter()
        .enumerate()
        .map(|(i, soc)| format!("{}:{}", (b'A' + i as u8) as char, soc))
        .collect::<Vec<_>>()
        .join("\t")
}

fn cancelled(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

async fn connect_battery(battery: &mut BatteryHandle) -> Result<(), SupervisorError> {
    if let Err(e) = battery.client.initialise().await {
        warn!(device = %battery.id(), "Initial handshake failed: {}", e);
    }

    let startup = battery.startup.clone();
    for attempt in 1..=startup.attempts {
        if battery.client.is_connected().await {
            info!(device = %battery.id(), "Battery connection established");
            metrics::record_device_status(battery.id(), true);
            return Ok(());
        }
        debug!(device = %battery.id(), attempt, "Battery not answering yet");

        if startup.rehandshake_after == Some(attempt) {
            warn!(device = %battery.id(), attempt, "Forcing handshake retry");
            if let Err(e) = battery.client.initialise().await {
                warn!(device = %battery.id(), "Handshake retry failed: {}", e);
            }
        }
        sleep(startup.interval).await;
    }

    metrics::record_device_status(battery.id(), false);
    Err(SupervisorError::Startup {
        device: battery.id().to_string(),
        source: ConnectError::Unresponsive {
            target: battery.id().to_string(),
        },
    })
}

async fn connect_device(handle: &mut DeviceHandle) -> Result<(), SupervisorError> {
    handle
        .device
        .open()
        .await
        .map_err(|source| SupervisorError::Startup {
            device: handle.id.clone(),
            source,
        })?;

    for attempt in 1..=handle.startup.attempts {
        sleep(handle.startup.interval).await;
        if handle.device.is_connected().await {
            info!(device = %handle.id, kind = %handle.kind, "Connection established");
            metrics::record_device_status(&handle.id, true);
            return Ok(());
        }
        debug!(device = %handle.id, attempt, "No answer to liveness probe");
    }

    metrics::record_device_status(&handle.id, false);
    Err(SupervisorError::Startup {
        device: handle.id.clone(),
        source: ConnectError::Unresponsive {
            target: handle.id.clone(),
        },
    })
}

async fn poll_battery(battery: &mut BatteryHandle) -> Result<BatteryTelemetry, BatteryError> {
    let poll = PollMetrics::start(battery.id());
    let result = async {
        let modules = battery.client.read_modules(battery.module_count).await?;
        let summary = aggregate(&modules)?;
        Ok::<_, BatteryError>(BatteryTelemetry {
            device_id: battery.id().to_string(),
            timestamp: Utc::now(),
            modules,
            summary,
        })
    }
    .await;

    match &result {
        Ok(_) => poll.success(),
        Err(BatteryError::Console(ConsoleError::Io(_))) => poll.failure("io"),
        Err(BatteryError::Console(_)) => poll.failure("protocol"),
        Err(BatteryError::Aggregate(_)) => poll.failure("aggregate"),
    }
    result
}

async fn poll_device(handle: &mut DeviceHandle) -> Result<DeviceSnapshot, FieldError> {
    let poll = PollMetrics::start(&handle.id);
    match read_table(handle.device.as_mut(), handle.kind.telemetry_table()).await {
        Ok(values) => {
            poll.success();
            Ok(DeviceSnapshot {
                device_id: handle.id.clone(),
                kind: handle.kind,
                timestamp: Utc::now(),
                values,
            })
        }
        Err(e) => {
            poll.failure(error_type(&e));
            Err(e)
        }
    }
}

fn error_type(error: &FieldError) -> &'static str {
    match error {
        FieldError::Io {
            source: IoError::Timeout(_),
            ..
        } => "timeout",
        FieldError::Io {
            source: IoError::Exception(_),
            ..
        } => "exception",
        FieldError::Io { .. } => "io",
        FieldError::Decode { .. } => "decode",
    }
}

fn device_success(handle: &mut DeviceHandle) {
    if handle.retry.count() > 0 {
        info!(device = %handle.id, "Recovered after {} failure(s)", handle.retry.count());
    }
    handle.retry.reset();
    metrics::record_retry_count(&handle.id, 0);
}

async fn device_failure(
    handle: &mut DeviceHandle,
    error: &dyn std::fmt::Display,
) -> Result<(), SupervisorError> {
    let failures = handle.retry.record_failure();
    metrics::record_retry_count(&handle.id, failures);
    warn!(device = %handle.id, retry = failures, "Poll failed: {}", error);

    match handle.policy.action(failures) {
        RetryAction::Continue => Ok(()),
        RetryAction::Reconnect => {
            warn!(
                device = %handle.id,
                retry = failures,
                "Reconnecting after {:?} cooldown",
                handle.policy.cooldown
            );
            sleep(handle.policy.cooldown).await;
            let result = handle.device.reconnect().await;
            metrics::record_reconnect(&handle.id, result.is_ok());
            if let Err(e) = result {
                warn!(device = %handle.id, retry = failures, "Reconnect failed: {}", e);
            }
            Ok(())
        }
        RetryAction::Abort => {
            error!(
                device = %handle.id,
                retry = failures,
                threshold = handle.policy.abort_after,
                "Retry budget exhausted"
            );
            Err(SupervisorError::RetryBudgetExhausted {
                device: handle.id.clone(),
                failures,
                threshold: handle.policy.abort_after,
            })
        }
    }
}

async fn battery_failure(
    battery: &mut BatteryHandle,
    error: &BatteryError,
) -> Result<(), SupervisorError> {
    let failures = battery.retry.record_failure();
    metrics::record_retry_count(battery.id(), failures);
    warn!(device = %battery.id(), retry = failures, "Battery poll failed: {}", error);

    match battery.policy.action(failures) {
        RetryAction::Continue => Ok(()),
        RetryAction::Reconnect => {
            warn!(
                device = %battery.id(),
                retry = failures,
                "Re-running handshake after {:?} cooldown",
                battery.policy.cooldown
            );
            sleep(battery.policy.cooldown).await;
            let result = battery.client.initialise().await;
            metrics::record_reconnect(battery.id(), result.is_ok());
            Ok(())
        }
        RetryAction::Abort => {
            error!(
                device = %battery.id(),
                retry = failures,
                threshold = battery.policy.abort_after,
                "Retry budget exhausted"
            );
            Err(SupervisorError::RetryBudgetExhausted {
                device: battery.id().to_string(),
                failures,
                threshold: battery.policy.abort_after,
            })
        }
    }
}
