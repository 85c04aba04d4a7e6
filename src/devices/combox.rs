//! Conext ComBox gateway (Modbus unit 201)
//!
//! The ComBox bridges Xanbus to Modbus TCP for the other devices. Its own
//! register space is only polled for identification and liveness.

use crate::modbus::{RegisterField, FIRMWARE_VERSION};

pub const TELEMETRY: &[RegisterField] = &[FIRMWARE_VERSION];
