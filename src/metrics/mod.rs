//! Prometheus metrics for SolarBridge
//!
//! Exposed on the configured listen address in Prometheus format:
//! - Device poll counts and latency
//! - Retry counters per device
//! - Battery state of charge
//! - Support register state and control writes
//! - MQTT publish counts

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::info;

/// Install the Prometheus recorder and serve it over HTTP
pub fn init_metrics(listen: &str) -> Result<()> {
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("Invalid metrics listen address: {}", listen))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .with_context(|| "Failed to install Prometheus exporter")?;

    info!("Prometheus metrics on http://{}/metrics", addr);
    Ok(())
}

/// Metrics for one device poll
pub struct PollMetrics {
    start: Instant,
    device_id: String,
}

impl PollMetrics {
    /// Start timing a device poll
    pub fn start(device_id: &str) -> Self {
        Self {
            start: Instant::now(),
            device_id: device_id.to_string(),
        }
    }

    /// Record successful poll
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            "solarbridge_polls_total",
            "device" => self.device_id.clone(),
            "status" => "success"
        )
        .increment(1);

        histogram!(
            "solarbridge_poll_duration_seconds",
            "device" => self.device_id
        )
        .record(duration);
    }

    /// Record failed poll
    pub fn failure(self, error_type: &'static str) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            "solarbridge_polls_total",
            "device" => self.device_id.clone(),
            "status" => "error"
        )
        .increment(1);

        counter!(
            "solarbridge_errors_total",
            "device" => self.device_id.clone(),
            "type" => error_type
        )
        .increment(1);

        // Still record the latency
        histogram!(
            "solarbridge_poll_duration_seconds",
            "device" => self.device_id
        )
        .record(duration);
    }
}

/// Record device connection status
pub fn record_device_status(device_id: &str, connected: bool) {
    gauge!(
        "solarbridge_device_connected",
        "device" => device_id.to_string()
    )
    .set(if connected { 1.0 } else { 0.0 });
}

/// Record consecutive failure count
pub fn record_retry_count(device_id: &str, count: u32) {
    gauge!(
        "solarbridge_retry_count",
        "device" => device_id.to_string()
    )
    .set(count as f64);
}

pub fn record_reconnect(device_id: &str, success: bool) {
    counter!(
        "solarbridge_reconnects_total",
        "device" => device_id.to_string(),
        "status" => if success { "success" } else { "error" }
    )
    .increment(1);
}

/// Record battery state of charge, per module and averaged
pub fn record_battery_soc(mean_soc: f64, module_socs: &[u8]) {
    gauge!("solarbridge_battery_soc_percent").set(mean_soc);
    for (i, soc) in module_socs.iter().enumerate() {
        gauge!(
            "solarbridge_module_soc_percent",
            "module" => (i + 1).to_string()
        )
        .set(*soc as f64);
    }
}

/// Record the support register state decided by the policy
pub fn record_support_state(enabled: bool) {
    gauge!("solarbridge_support_enabled").set(if enabled { 1.0 } else { 0.0 });
}

/// Record register writes issued by the control policy
pub fn record_control_writes(count: usize) {
    counter!("solarbridge_control_writes_total").increment(count as u64);
}

/// Record poll cycle timing
pub fn record_poll_cycle(duration: Duration) {
    histogram!("solarbridge_poll_cycle_seconds").record(duration.as_secs_f64());
}

/// Record MQTT publish event
pub fn record_mqtt_publish(device_id: &str, success: bool) {
    counter!(
        "solarbridge_mqtt_publishes_total",
        "device" => device_id.to_string(),
        "status" => if success { "success" } else { "error" }
    )
    .increment(1);
}

/// Record telemetry messages a slow MQTT subscriber skipped
pub fn record_mqtt_dropped(count: u64) {
    counter!("solarbridge_mqtt_dropped_total").increment(count);
}

/// Record MQTT connection status
pub fn record_mqtt_connection(connected: bool) {
    gauge!("solarbridge_mqtt_connected").set(if connected { 1.0 } else { 0.0 });
}
