//! RS-232 transport.
//!
//! Lock-ins and the LakeShore bridge sit on USB-serial adapters. Framing is 8 data
//! bits, one stop bit, no flow control; baud rate, parity and terminator come from
//! the instrument definition (SR830 uses 19200 baud even parity with CR, the
//! LakeShore 370 9600 baud odd parity with CRLF).

use crate::config::Parity;
use crate::hardware::transport::Transport;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::debug;

/// Line-oriented serial connection.
pub struct SerialTransport {
    path: String,
    port: BufReader<SerialStream>,
    terminator: String,
    timeout: Duration,
}

impl SerialTransport {
    /// Open a serial port
    ///
    /// # Errors
    /// Returns error if the port cannot be opened
    pub fn open(
        path: &str,
        baud_rate: u32,
        parity: Parity,
        terminator: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let parity = match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        };
        let port = tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(parity)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .with_context(|| format!("Failed to open serial port {}", path))?;

        Ok(Self {
            path: path.to_string(),
            port: BufReader::new(port),
            terminator: terminator.to_string(),
            timeout,
        })
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn write(&mut self, command: &str) -> Result<()> {
        debug!(port = %self.path, command, "serial write");
        let line = format!("{}{}", command, self.terminator);
        let port = self.port.get_mut();
        port.write_all(line.as_bytes())
            .await
            .context("Failed to write to serial port")?;
        port.flush().await.context("Failed to flush serial port")?;
        Ok(())
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        self.write(command).await?;

        let delimiter = self.terminator.bytes().last().unwrap_or(b'\n');
        let mut buffer = Vec::new();
        tokio::time::timeout(self.timeout, self.port.read_until(delimiter, &mut buffer))
            .await
            .map_err(|_| anyhow!("Serial read timeout on {} after '{}'", self.path, command))?
            .context("Failed to read from serial port")?;

        let reply = String::from_utf8_lossy(&buffer).trim().to_string();
        debug!(port = %self.path, command, reply = %reply, "serial query");
        Ok(reply)
    }

    fn describe(&self) -> String {
        format!("serial://{}", self.path)
    }
}
