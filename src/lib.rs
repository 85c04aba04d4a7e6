//! SolarBridge - Battery-aware inverter controller
//!
//! Polls a Pylontech battery stack over its serial console and Conext
//! XW+/MPPT devices over Modbus TCP, then toggles the inverter's support
//! mode from the stack's state of charge.

pub mod config;
pub mod console;
pub mod control;
pub mod devices;
pub mod error;
pub mod metrics;
pub mod modbus;
pub mod mqtt;
pub mod sink;
pub mod supervisor;
pub mod telemetry;
