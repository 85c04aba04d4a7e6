//! Modbus client context types

use std::time::Duration;

use tokio::time::timeout;
use tokio_modbus::client::Context as TcpContext;
use tokio_modbus::prelude::*;

use crate::error::IoError;

/// Live TCP context with a per-request deadline
pub struct Context {
    inner: TcpContext,
    request_timeout: Duration,
}

impl Context {
    pub fn new(inner: TcpContext, request_timeout: Duration) -> Self {
        Self {
            inner,
            request_timeout,
        }
    }

    pub async fn read_holding_registers(&mut self, addr: u16, cnt: u16) -> Result<Vec<u16>, IoError> {
        let result = timeout(self.request_timeout, self.inner.read_holding_registers(addr, cnt))
            .await
            .map_err(|_| IoError::Timeout(self.request_timeout))??;
        let words = result.map_err(IoError::Exception)?;

        if words.len() != cnt as usize {
            return Err(IoError::ShortResponse {
                expected: cnt as usize,
                actual: words.len(),
            });
        }
        Ok(words)
    }

    pub async fn write_single_register(&mut self, addr: u16, value: u16) -> Result<(), IoError> {
        let result = timeout(self.request_timeout, self.inner.write_single_register(addr, value))
            .await
            .map_err(|_| IoError::Timeout(self.request_timeout))??;
        result.map_err(IoError::Exception)
    }

    pub async fn write_multiple_registers(&mut self, addr: u16, values: &[u16]) -> Result<(), IoError> {
        let result = timeout(
            self.request_timeout,
            self.inner.write_multiple_registers(addr, values),
        )
        .await
        .map_err(|_| IoError::Timeout(self.request_timeout))??;
        result.map_err(IoError::Exception)
    }
}
