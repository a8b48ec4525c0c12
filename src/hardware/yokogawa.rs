//! Yokogawa DC source used as the gate supply.
//!
//! The source is either in voltage or current mode; setting a level in the other
//! mode is refused with a warning rather than silently changing the function.

use crate::hardware::broker::InstrumentBroker;
use anyhow::Result;
use std::sync::Arc;
use tracing::warn;

/// Source function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFunction {
    /// Voltage source
    Voltage,
    /// Current source
    Current,
}

/// Gate source driver.
#[derive(Clone)]
pub struct Yokogawa {
    broker: Arc<InstrumentBroker>,
    id: String,
}

impl Yokogawa {
    /// Driver for the source attached under `id`.
    pub fn new(broker: Arc<InstrumentBroker>, id: impl Into<String>) -> Self {
        Self {
            broker,
            id: id.into(),
        }
    }

    /// Active source function, `None` if the reply is not recognised.
    pub async fn function(&self) -> Result<Option<SourceFunction>> {
        let reply = self.broker.query(&self.id, ":SOUR:FUNC?").await?;
        let reply = reply.trim().to_lowercase();
        Ok(if reply.starts_with("volt") {
            Some(SourceFunction::Voltage)
        } else if reply.starts_with("curr") {
            Some(SourceFunction::Current)
        } else {
            None
        })
    }

    /// Output level in volts (voltage mode only). Returns whether it was applied.
    pub async fn set_voltage(&self, volts: f64) -> Result<bool> {
        self.set_level(SourceFunction::Voltage, volts).await
    }

    /// Output level in amperes (current mode only). Returns whether it was applied.
    pub async fn set_current(&self, amps: f64) -> Result<bool> {
        self.set_level(SourceFunction::Current, amps).await
    }

    /// Switch the output on or off.
    pub async fn set_output(&self, on: bool) -> Result<()> {
        self.broker
            .write(&self.id, &format!(":OUTP {}", u8::from(on)))
            .await
    }

    async fn set_level(&self, wanted: SourceFunction, level: f64) -> Result<bool> {
        let actual = self.function().await?;
        if actual != Some(wanted) {
            warn!(
                instrument = %self.id,
                ?wanted,
                ?actual,
                "Gate source is in the wrong mode, level not changed"
            );
            return Ok(false);
        }
        self.broker
            .write(&self.id, &format!(":SOURCE:LEVEL {}", level))
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{simulated, SimulatedModel};

    #[tokio::test]
    async fn test_level_respects_function() {
        let broker = Arc::new(InstrumentBroker::new());
        let transport = simulated(SimulatedModel::Yokogawa);
        let log = transport.log();
        broker.attach("gate", Box::new(transport)).await;
        let gate = Yokogawa::new(broker, "gate");

        assert!(gate.set_voltage(0.5).await.unwrap());
        assert!(!gate.set_current(1e-6).await.unwrap());
        gate.set_output(true).await.unwrap();

        assert_eq!(log.count(":SOURCE:LEVEL"), 1);
        assert_eq!(log.commands().last().unwrap(), ":OUTP 1");
    }
}
