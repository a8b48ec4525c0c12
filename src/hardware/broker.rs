//! Instrument Access Broker.
//!
//! All instruments hang off one physical bus (GPIB, or serial adapters behind one
//! hub) that cannot tolerate interleaved transactions: a query from the acquisition
//! engine must not be split by a command from the interpreter. The broker owns
//! every transport behind a single `tokio::sync::Mutex`, so each write, and each
//! write-then-read query, is atomic with respect to every other caller.
//!
//! Callers that need several commands back to back without anyone else on the bus
//! take the guard explicitly with [`InstrumentBroker::lock`]. The guard is released
//! when dropped, on every exit path including `?` returns mid-transaction.
//!
//! # Example
//! ```no_run
//! use rig_daq::hardware::broker::InstrumentBroker;
//! use rig_daq::hardware::mock::{simulated, SimulatedModel};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let broker = InstrumentBroker::new();
//! broker.attach("r1", Box::new(simulated(SimulatedModel::Sr830))).await;
//!
//! let snap = broker.query_values("r1", "SNAP? 3,4").await?;
//! {
//!     let mut bus = broker.lock().await;
//!     bus.write("r1", "AOFF 3").await?;
//!     let offset = bus.query("r1", "OEXP? 3").await?;
//!     # let _ = (snap, offset);
//! }
//! # Ok(())
//! # }
//! ```

use crate::config::RigConfig;
use crate::error::AppResult;
use crate::hardware::transport::{self, Transport};
use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

type Bus = HashMap<String, Box<dyn Transport>>;

/// Serializes every bus transaction across all callers.
pub struct InstrumentBroker {
    bus: Mutex<Bus>,
}

impl Default for InstrumentBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InstrumentBroker {
    /// Empty broker; attach transports before use.
    pub fn new() -> Self {
        Self {
            bus: Mutex::new(HashMap::new()),
        }
    }

    /// Open a transport for every enabled instrument in the configuration.
    pub async fn from_config(config: &RigConfig) -> AppResult<Self> {
        let broker = Self::new();
        for definition in config.enabled_instruments() {
            let transport = transport::open(definition).await?;
            info!(
                instrument = %definition.id,
                endpoint = %transport.describe(),
                "Instrument attached"
            );
            broker.attach(definition.id.clone(), transport).await;
        }
        Ok(broker)
    }

    /// Register a transport under an instrument id, replacing any previous one.
    pub async fn attach(&self, id: impl Into<String>, transport: Box<dyn Transport>) {
        self.bus.lock().await.insert(id.into(), transport);
    }

    /// Take exclusive ownership of the bus until the guard is dropped.
    pub async fn lock(&self) -> BusGuard<'_> {
        BusGuard {
            bus: self.bus.lock().await,
        }
    }

    /// One write transaction.
    pub async fn write(&self, id: &str, command: &str) -> Result<()> {
        self.lock().await.write(id, command).await
    }

    /// One write-then-read transaction.
    pub async fn query(&self, id: &str, command: &str) -> Result<String> {
        self.lock().await.query(id, command).await
    }

    /// One query whose reply is a comma-separated list of numbers.
    pub async fn query_values(&self, id: &str, command: &str) -> Result<Vec<f64>> {
        self.lock().await.query_values(id, command).await
    }
}

/// Exclusive access to the bus.
pub struct BusGuard<'a> {
    bus: MutexGuard<'a, Bus>,
}

impl BusGuard<'_> {
    fn transport(&mut self, id: &str) -> Result<&mut Box<dyn Transport>> {
        self.bus
            .get_mut(id)
            .ok_or_else(|| anyhow!("No instrument '{}' attached to the bus", id))
    }

    /// Send a command with no reply.
    pub async fn write(&mut self, id: &str, command: &str) -> Result<()> {
        self.transport(id)?
            .write(command)
            .await
            .with_context(|| format!("{}: write '{}'", id, command))
    }

    /// Send a command and read its reply.
    pub async fn query(&mut self, id: &str, command: &str) -> Result<String> {
        self.transport(id)?
            .query(command)
            .await
            .with_context(|| format!("{}: query '{}'", id, command))
    }

    /// Query and parse a comma-separated numeric reply.
    pub async fn query_values(&mut self, id: &str, command: &str) -> Result<Vec<f64>> {
        let reply = self.query(id, command).await?;
        parse_values(&reply).with_context(|| format!("{}: reply to '{}'", id, command))
    }
}

/// Parse a comma-separated numeric reply such as `"1.2E-6,45.0"`.
pub fn parse_values(reply: &str) -> Result<Vec<f64>> {
    let trimmed = reply.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("Empty reply"));
    }
    trimmed
        .split(',')
        .map(|field| {
            let field = field.trim();
            field
                .parse::<f64>()
                .with_context(|| format!("Failed to parse '{}' as a number", field))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockTransport;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_parse_values() {
        assert_eq!(parse_values("1.5E-3,-12.0\r").unwrap(), vec![1.5e-3, -12.0]);
        assert_eq!(parse_values("+0007").unwrap(), vec![7.0]);
        assert!(parse_values("").is_err());
        assert!(parse_values("1.0,abc").is_err());
    }

    #[tokio::test]
    async fn test_unknown_instrument_is_an_error() {
        let broker = InstrumentBroker::new();
        let err = broker.query("ghost", "*IDN?").await.unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn test_guard_released_after_error() {
        let broker = InstrumentBroker::new();
        let failing = MockTransport::new(|_cmd| Err(anyhow!("bus timeout")));
        broker.attach("r1", Box::new(failing)).await;

        assert!(broker.query("r1", "SNAP? 3,4").await.is_err());
        // A second transaction would deadlock if the guard leaked.
        let second = tokio::time::timeout(Duration::from_secs(1), broker.query("r1", "LIAS?")).await;
        assert!(second.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_transactions_never_interleave() {
        let broker = Arc::new(InstrumentBroker::new());
        let transport = MockTransport::with_latency(
            |cmd| Ok(Some(cmd.to_string())),
            Duration::from_millis(2),
        );
        let log = transport.log();
        broker.attach("dev", Box::new(transport)).await;

        let mut tasks = Vec::new();
        for worker in 0..4 {
            let broker = Arc::clone(&broker);
            tasks.push(tokio::spawn(async move {
                for i in 0..10 {
                    let mut bus = broker.lock().await;
                    bus.write("dev", &format!("BEGIN {worker} {i}")).await.unwrap();
                    bus.write("dev", &format!("END {worker} {i}")).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let commands = log.commands();
        assert_eq!(commands.len(), 80);
        for pair in commands.chunks(2) {
            let begin = pair[0].strip_prefix("BEGIN ").unwrap();
            let end = pair[1].strip_prefix("END ").unwrap();
            assert_eq!(begin, end);
        }
    }
}
