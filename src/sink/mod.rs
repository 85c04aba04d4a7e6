//! Telemetry persistence
//!
//! The supervisor hands every successful poll to a [`TelemetrySink`]. Storage
//! failures are logged by the caller and never stop the control loop.

use crate::telemetry::TelemetryRecord;

mod csv_file;

pub use csv_file::CsvSink;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Somewhere to put telemetry
pub trait TelemetrySink: Send {
    fn record(&mut self, record: &TelemetryRecord) -> Result<(), SinkError>;
}
