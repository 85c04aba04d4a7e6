//! Error taxonomy shared by the device clients and the supervisor

use std::time::Duration;

use tokio_modbus::ExceptionCode;

/// A transport could not be established.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid socket address {host}:{port}")]
    InvalidAddress { host: String, port: u16 },
    #[error("connect to {target} timed out after {timeout:?}")]
    Timeout { target: String, timeout: Duration },
    #[error("connect to {target} failed: {source}")]
    Io {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{target} did not answer the liveness probe")]
    Unresponsive { target: String },
}

/// A request failed after the transport was established.
#[derive(Debug, thiserror::Error)]
pub enum IoError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Modbus exception: {0:?}")]
    Exception(ExceptionCode),
    #[error("Transport error: {0}")]
    Transport(#[from] tokio_modbus::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("expected {expected} registers, got {actual}")]
    ShortResponse { expected: usize, actual: usize },
    #[error("no connection available")]
    NotConnected,
}

/// Invalid configuration. Always fatal, raised before any device I/O.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("soc_low ({low}) must be below soc_high ({high})")]
    ThresholdOrder { low: u8, high: u8 },
    #[error("soc_high ({0}) must not exceed 100")]
    ThresholdRange(u8),
    #[error("battery module count {0} is outside 1..=8")]
    ModuleCount(usize),
    #[error("cadence must be greater than zero")]
    ZeroCadence,
    #[error("{device}: reconnect threshold {reconnect_after} must be below abort threshold {abort_after}")]
    RetryThresholds {
        device: String,
        reconnect_after: u32,
        abort_after: u32,
    },
    #[error("missing required field: {0}")]
    Missing(&'static str),
}
