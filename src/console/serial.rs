//! Serial port transport for the battery console

use async_trait::async_trait;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::debug;

use super::ConsoleTransport;

/// 8N1 serial port reopened at whatever baud rate the handshake asks for
pub struct SerialConsole {
    path: String,
    read_timeout: Duration,
    write_timeout: Duration,
    port: Option<SerialStream>,
}

impl SerialConsole {
    /// `read_timeout` is the inter-byte gap that ends a read
    pub fn new(path: impl Into<String>, read_timeout: Duration, write_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            read_timeout,
            write_timeout,
            port: None,
        }
    }

    fn port(&mut self) -> io::Result<&mut SerialStream> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port not open"))
    }
}

#[async_trait]
impl ConsoleTransport for SerialConsole {
    async fn open(&mut self, baud_rate: u32) -> io::Result<()> {
        self.port = None;
        let port = tokio_serial::new(&self.path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .open_native_async()
            .map_err(io::Error::from)?;

        debug!("Opened {} at {} baud", self.path, baud_rate);
        self.port = Some(port);
        Ok(())
    }

    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let write_timeout = self.write_timeout;
        let port = self.port()?;
        timeout(write_timeout, async {
            port.write_all(bytes).await?;
            port.flush().await
        })
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "serial write timed out"))?
    }

    async fn read_up_to(&mut self, limit: usize) -> io::Result<Vec<u8>> {
        let read_timeout = self.read_timeout;
        let port = self.port()?;
        let mut buf = Vec::with_capacity(limit);
        let mut chunk = [0u8; 256];

        while buf.len() < limit {
            let want = chunk.len().min(limit - buf.len());
            match timeout(read_timeout, port.read(&mut chunk[..want])).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => return Err(e),
                // line went quiet
                Err(_) => break,
            }
        }
        Ok(buf)
    }

    async fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("Closed {}", self.path);
        }
    }
}
