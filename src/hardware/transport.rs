//! Byte-level transports to instruments.
//!
//! A `Transport` moves one ASCII command to an instrument and, for queries, reads
//! one reply back. Transports are owned by the [`InstrumentBroker`](super::broker::InstrumentBroker)
//! and never shared directly; the broker's lock is what makes a query atomic on the bus.
//!
//! Implementations:
//! - `TcpTransport`: persistent socket, line terminated (AMI 430 magnet controller)
//! - `MssTransport`: one connection per request, 4-byte length-prefixed replies
//!   (CFMS measurement system software)
//! - `SerialTransport` (feature `instrument_serial`), `VisaTransport`
//!   (feature `instrument_visa`), and `MockTransport` in sibling modules

use crate::config::{InstrumentDefinition, TransportConfig};
use crate::error::{AppResult, DaqError};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// One instrument connection.
#[async_trait]
pub trait Transport: Send {
    /// Send a command that produces no reply.
    async fn write(&mut self, command: &str) -> Result<()>;

    /// Send a command and read its reply, without the line terminator.
    async fn query(&mut self, command: &str) -> Result<String>;

    /// Human-readable endpoint description for logs.
    fn describe(&self) -> String;
}

/// Open the transport named by an instrument definition.
pub async fn open(definition: &InstrumentDefinition) -> AppResult<Box<dyn Transport>> {
    match &definition.transport {
        TransportConfig::Tcp {
            address,
            terminator,
            timeout_ms,
        } => {
            let transport = TcpTransport::connect(
                address,
                terminator,
                Duration::from_millis(*timeout_ms),
            )
            .await
            .map_err(DaqError::instrument)?;
            Ok(Box::new(transport))
        }
        TransportConfig::Mss {
            address,
            timeout_ms,
        } => Ok(Box::new(MssTransport::new(
            address.clone(),
            Duration::from_millis(*timeout_ms),
        ))),
        TransportConfig::Serial {
            port,
            baud_rate,
            parity,
            terminator,
            timeout_ms,
        } => {
            #[cfg(feature = "instrument_serial")]
            {
                let transport = super::serial::SerialTransport::open(
                    port,
                    *baud_rate,
                    *parity,
                    terminator,
                    Duration::from_millis(*timeout_ms),
                )
                .map_err(DaqError::instrument)?;
                Ok(Box::new(transport))
            }
            #[cfg(not(feature = "instrument_serial"))]
            {
                let _ = (port, baud_rate, parity, terminator, timeout_ms);
                Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()))
            }
        }
        TransportConfig::Visa {
            resource,
            terminator,
            timeout_ms,
        } => {
            #[cfg(feature = "instrument_visa")]
            {
                let transport = super::visa::VisaTransport::open(
                    resource,
                    terminator,
                    Duration::from_millis(*timeout_ms),
                )
                .await
                .map_err(DaqError::instrument)?;
                Ok(Box::new(transport))
            }
            #[cfg(not(feature = "instrument_visa"))]
            {
                let _ = (resource, terminator, timeout_ms);
                Err(DaqError::FeatureNotEnabled("instrument_visa".to_string()))
            }
        }
        TransportConfig::Simulated { model } => Ok(Box::new(super::mock::simulated(*model))),
    }
}

/// Persistent line-terminated TCP socket.
pub struct TcpTransport {
    address: String,
    stream: BufReader<TcpStream>,
    terminator: String,
    timeout: Duration,
}

impl TcpTransport {
    /// Connect to `host:port`.
    pub async fn connect(address: &str, terminator: &str, read_timeout: Duration) -> Result<Self> {
        let stream = timeout(read_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| anyhow!("Timed out connecting to {}", address))?
            .with_context(|| format!("Failed to connect to {}", address))?;
        stream.set_nodelay(true).ok();

        Ok(Self {
            address: address.to_string(),
            stream: BufReader::new(stream),
            terminator: terminator.to_string(),
            timeout: read_timeout,
        })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn write(&mut self, command: &str) -> Result<()> {
        debug!(address = %self.address, command, "tcp write");
        let line = format!("{}{}", command, self.terminator);
        self.stream
            .get_mut()
            .write_all(line.as_bytes())
            .await
            .context("TCP write failed")?;
        Ok(())
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        self.write(command).await?;

        let delimiter = self.terminator.bytes().last().unwrap_or(b'\n');
        let mut buffer = Vec::new();
        let read = timeout(self.timeout, self.stream.read_until(delimiter, &mut buffer))
            .await
            .map_err(|_| anyhow!("Timed out waiting for reply to '{}'", command))?
            .context("TCP read failed")?;
        if read == 0 {
            return Err(anyhow!("Connection to {} closed", self.address));
        }

        let reply = String::from_utf8_lossy(&buffer).trim().to_string();
        debug!(address = %self.address, command, reply = %reply, "tcp query");
        Ok(reply)
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

/// Largest MSS reply accepted; larger length prefixes are treated as corrupt.
const MAX_MSS_REPLY: usize = 1 << 20;

/// MSS socket protocol: every request opens a fresh connection, sends
/// `command\r\n` and, for queries, reads a little-endian `i32` byte count followed
/// by that many ASCII bytes.
pub struct MssTransport {
    address: String,
    timeout: Duration,
}

impl MssTransport {
    /// Transport for the MSS server at `host:port`.
    pub fn new(address: String, timeout: Duration) -> Self {
        Self { address, timeout }
    }

    async fn send(&self, command: &str) -> Result<TcpStream> {
        let mut stream = timeout(self.timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| anyhow!("Timed out connecting to MSS at {}", self.address))?
            .with_context(|| format!("Failed to connect to MSS at {}", self.address))?;
        stream
            .write_all(format!("{}\r\n", command).as_bytes())
            .await
            .context("MSS write failed")?;
        Ok(stream)
    }
}

#[async_trait]
impl Transport for MssTransport {
    async fn write(&mut self, command: &str) -> Result<()> {
        debug!(address = %self.address, command, "mss write");
        self.send(command).await.map(|_| ())
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        let mut stream = self.send(command).await?;
        let reply = timeout(self.timeout, async {
            let size = stream.read_i32_le().await.context("MSS reply size")?;
            let size = usize::try_from(size)
                .map_err(|_| anyhow!("MSS sent negative reply size {}", size))?;
            if size > MAX_MSS_REPLY {
                return Err(anyhow!(
                    "MSS reply size {} exceeds {} bytes",
                    size,
                    MAX_MSS_REPLY
                ));
            }
            let mut payload = vec![0u8; size];
            stream
                .read_exact(&mut payload)
                .await
                .context("MSS reply payload")?;
            Ok::<_, anyhow::Error>(payload)
        })
        .await
        .map_err(|_| anyhow!("Timed out waiting for MSS reply to '{}'", command))??;

        let reply = decode_mss_payload(&reply);
        debug!(address = %self.address, command, reply = %reply, "mss query");
        Ok(reply)
    }

    fn describe(&self) -> String {
        format!("mss://{}", self.address)
    }
}

fn decode_mss_payload(payload: &[u8]) -> String {
    let text = String::from_utf8_lossy(payload);
    text.strip_suffix("\r\n").unwrap_or(&text).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_decode_mss_payload_strips_crlf() {
        assert_eq!(decode_mss_payload(b"1.80,0\r\n"), "1.80,0");
        assert_eq!(decode_mss_payload(b"TRUE"), "TRUE");
    }

    #[tokio::test]
    async fn test_tcp_transport_query() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut socket = BufReader::new(socket);
            let mut line = String::new();
            socket.read_line(&mut line).await.unwrap();
            assert_eq!(line, "FIELD:MAG?\r\n");
            socket.get_mut().write_all(b"0.2500\r\n").await.unwrap();
        });

        let mut transport = TcpTransport::connect(&address, "\r\n", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(transport.query("FIELD:MAG?").await.unwrap(), "0.2500");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_mss_transport_length_prefixed_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut socket = BufReader::new(socket);
            let mut line = String::new();
            socket.read_line(&mut line).await.unwrap();
            assert_eq!(line, "READ? TB\r\n");
            let payload = b"1.80,0\r\n";
            socket
                .get_mut()
                .write_all(&(payload.len() as i32).to_le_bytes())
                .await
                .unwrap();
            socket.get_mut().write_all(payload).await.unwrap();
        });

        let mut transport = MssTransport::new(address, Duration::from_secs(1));
        assert_eq!(transport.query("READ? TB").await.unwrap(), "1.80,0");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_mss_transport_rejects_oversized_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut socket = BufReader::new(socket);
            let mut line = String::new();
            socket.read_line(&mut line).await.unwrap();
            socket
                .get_mut()
                .write_all(&i32::MAX.to_le_bytes())
                .await
                .unwrap();
        });

        let mut transport = MssTransport::new(address, Duration::from_secs(1));
        let err = transport.query("READ? TB").await.unwrap_err();
        assert!(err.to_string().contains("exceeds"), "{:#}", err);
        server.await.unwrap();
    }
}
