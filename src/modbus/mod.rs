//! Modbus protocol handling
//!
//! One [`ModbusClient`] per logical device (host + unit id). The supervisor
//! talks to devices through the [`RegisterDevice`] trait so a device can be
//! replaced by a fake in tests.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

use crate::config::ModbusDeviceConfig;
use crate::error::{ConnectError, IoError};

pub mod client;
pub mod codec;

use codec::{DecodeError, FieldDescriptor, RegisterValue};

/// Firmware version string, readable on every Conext device
pub const FIRMWARE_VERSION: RegisterField = RegisterField {
    name: "firmware_version",
    address: 0x001E,
    descriptor: FieldDescriptor::FixedString { words: 7 },
    unit: None,
};

/// One entry of a device's register table
#[derive(Debug, Clone, Copy)]
pub struct RegisterField {
    pub name: &'static str,
    pub address: u16,
    pub descriptor: FieldDescriptor,
    pub unit: Option<&'static str>,
}

impl RegisterField {
    pub const fn word_count(&self) -> u16 {
        self.descriptor.word_count()
    }
}

/// Register-level access to one device
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegisterDevice: Send {
    /// Establish the transport
    async fn open(&mut self) -> Result<(), ConnectError>;

    /// Single request/response read of `count` holding registers
    async fn read_registers(&mut self, start: u16, count: u16) -> Result<Vec<u16>, IoError>;

    /// Single or multi register write
    async fn write_registers(&mut self, start: u16, values: &[u16]) -> Result<(), IoError>;

    /// Liveness probe: a well-formed reply to a firmware-version read
    async fn is_connected(&mut self) -> bool;

    /// Close any open transport, reopen, then wait the settle delay
    async fn reconnect(&mut self) -> Result<(), ConnectError>;

    /// Drop the transport. Idempotent.
    async fn close(&mut self);
}

#[derive(Debug, thiserror::Error)]
pub enum FieldError {
    #[error("{field}: {source}")]
    Io {
        field: &'static str,
        #[source]
        source: IoError,
    },
    #[error("{field}: {source}")]
    Decode {
        field: &'static str,
        #[source]
        source: DecodeError,
    },
}

/// Read and decode one field
pub async fn read_field(
    device: &mut dyn RegisterDevice,
    field: &RegisterField,
) -> Result<RegisterValue, FieldError> {
    let words = device
        .read_registers(field.address, field.word_count())
        .await
        .map_err(|source| FieldError::Io {
            field: field.name,
            source,
        })?;
    codec::decode(&words, &field.descriptor).map_err(|source| FieldError::Decode {
        field: field.name,
        source,
    })
}

/// Read a whole register table in order. The first failing field aborts the read.
pub async fn read_table(
    device: &mut dyn RegisterDevice,
    table: &[RegisterField],
) -> Result<Vec<(&'static str, RegisterValue)>, FieldError> {
    let mut values = Vec::with_capacity(table.len());
    for field in table {
        let value = read_field(device, field).await?;
        debug!("{} = {} {}", field.name, value, field.unit.unwrap_or(""));
        values.push((field.name, value));
    }
    Ok(values)
}

/// Modbus TCP client for a single device
pub struct ModbusClient {
    device_id: String,
    host: String,
    port: u16,
    unit_id: u8,
    connect_timeout: Duration,
    request_timeout: Duration,
    settle_delay: Duration,
    context: Option<client::Context>,
}

impl ModbusClient {
    /// Create a client from device configuration. No I/O happens until [`RegisterDevice::open`].
    pub fn new(config: &ModbusDeviceConfig) -> Self {
        Self {
            device_id: config.id.clone(),
            host: config.host.clone(),
            port: config.port,
            unit_id: config.unit_id,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            settle_delay: Duration::from_millis(config.settle_delay_ms),
            context: None,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    fn target(&self) -> String {
        format!("{}:{} (unit {})", self.host, self.port, self.unit_id)
    }

    fn context(&mut self) -> Result<&mut client::Context, IoError> {
        self.context.as_mut().ok_or(IoError::NotConnected)
    }

    /// Read the firmware version string
    pub async fn read_firmware(&mut self) -> Result<String, FieldError> {
        match read_field(self, &FIRMWARE_VERSION).await? {
            RegisterValue::Text(s) => Ok(s),
            other => Ok(other.to_string()),
        }
    }
}

#[async_trait]
impl RegisterDevice for ModbusClient {
    async fn open(&mut self) -> Result<(), ConnectError> {
        // at most one transport per handle
        self.context = None;

        let addr: SocketAddr = format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| ConnectError::InvalidAddress {
                host: self.host.clone(),
                port: self.port,
            })?;

        info!(
            "Connecting to Modbus TCP: {} (unit {}) for device {}",
            addr, self.unit_id, self.device_id
        );

        let ctx = timeout(self.connect_timeout, tcp::connect_slave(addr, Slave(self.unit_id)))
            .await
            .map_err(|_| ConnectError::Timeout {
                target: self.target(),
                timeout: self.connect_timeout,
            })?
            .map_err(|source| ConnectError::Io {
                target: self.target(),
                source,
            })?;

        self.context = Some(client::Context::new(ctx, self.request_timeout));
        Ok(())
    }

    async fn read_registers(&mut self, start: u16, count: u16) -> Result<Vec<u16>, IoError> {
        debug!(
            "Reading {} holding registers from address {:#06x} on {}",
            count, start, self.device_id
        );
        let result = self.context()?.read_holding_registers(start, count).await;
        if let Err(IoError::Io(_) | IoError::Transport(_)) = &result {
            // a broken socket is not worth reusing
            self.context = None;
        }
        result
    }

    async fn write_registers(&mut self, start: u16, values: &[u16]) -> Result<(), IoError> {
        let ctx = self.context()?;
        match values {
            [single] => ctx.write_single_register(start, *single).await?,
            _ => ctx.write_multiple_registers(start, values).await?,
        }

        info!(
            "Wrote {:?} to register {:#06x} on device {}",
            values, start, self.device_id
        );
        Ok(())
    }

    async fn is_connected(&mut self) -> bool {
        if self.context.is_none() {
            return false;
        }
        match self.read_firmware().await {
            Ok(firmware) => {
                debug!("{} firmware {}", self.device_id, firmware);
                true
            }
            Err(e) => {
                debug!("{} liveness probe failed: {}", self.device_id, e);
                false
            }
        }
    }

    async fn reconnect(&mut self) -> Result<(), ConnectError> {
        warn!("Reconnecting device {} at {}", self.device_id, self.target());
        self.close().await;
        self.open().await?;
        sleep(self.settle_delay).await;
        Ok(())
    }

    async fn close(&mut self) {
        if self.context.take().is_some() {
            debug!("Closed Modbus connection to {}", self.device_id);
        }
    }
}
