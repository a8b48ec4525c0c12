//! American Magnetics 430 magnet power supply programmer (TCP, port 7180).
//!
//! The supply ramps on its own once target and rate are configured; `STATE?` reports
//! 1 while ramping and 2 when holding at target.

use crate::hardware::broker::InstrumentBroker;
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;

/// Decoded `STATE?` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MagnetState {
    /// Ramping to target
    Ramping,
    /// Holding at target
    Holding,
    /// Ramp paused
    Paused,
    /// Manual ramp up/down
    Manual,
    /// Ramping to zero
    Zeroing,
    /// Quench detected
    Quench,
    /// At zero current
    AtZero,
    /// Persistent switch heating or cooling
    Switching,
    /// Anything else
    Unknown(u8),
}

impl MagnetState {
    fn from_code(code: u8) -> Self {
        match code {
            1 => MagnetState::Ramping,
            2 => MagnetState::Holding,
            3 => MagnetState::Paused,
            4 | 5 => MagnetState::Manual,
            6 => MagnetState::Zeroing,
            7 => MagnetState::Quench,
            8 => MagnetState::AtZero,
            9 | 10 => MagnetState::Switching,
            other => MagnetState::Unknown(other),
        }
    }
}

/// AMI 430 driver.
#[derive(Clone)]
pub struct Ami430 {
    broker: Arc<InstrumentBroker>,
    id: String,
}

impl Ami430 {
    /// Driver for the supply attached under `id`.
    pub fn new(broker: Arc<InstrumentBroker>, id: impl Into<String>) -> Self {
        Self {
            broker,
            id: id.into(),
        }
    }

    /// Field at the magnet, in tesla.
    pub async fn field(&self) -> Result<f64> {
        self.broker
            .query_values(&self.id, "FIELD:MAG?")
            .await?
            .first()
            .copied()
            .ok_or_else(|| anyhow!("{}: empty FIELD:MAG? reply", self.id))
    }

    /// Configure ramp segment 1 and the target field.
    pub async fn set_target(&self, tesla: f64, rate_t_per_min: f64) -> Result<()> {
        let mut bus = self.broker.lock().await;
        bus.write(
            &self.id,
            &format!("CONFIGURE:RAMP:RATE:FIELD 1,{},1;", rate_t_per_min),
        )
        .await?;
        bus.write(&self.id, &format!("CONFIGURE:FIELD:TARGET {};", tesla))
            .await
    }

    /// Current ramp state.
    pub async fn state(&self) -> Result<MagnetState> {
        let reply = self.broker.query(&self.id, "STATE?").await?;
        let code = reply
            .trim()
            .parse::<u8>()
            .with_context(|| format!("{}: bad STATE? reply '{}'", self.id, reply))?;
        Ok(MagnetState::from_code(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockTransport;

    #[test]
    fn test_state_codes() {
        assert_eq!(MagnetState::from_code(1), MagnetState::Ramping);
        assert_eq!(MagnetState::from_code(2), MagnetState::Holding);
        assert_eq!(MagnetState::from_code(42), MagnetState::Unknown(42));
    }

    #[tokio::test]
    async fn test_set_target_commands() {
        let broker = Arc::new(InstrumentBroker::new());
        let transport = MockTransport::new(|cmd| match cmd {
            "STATE?" => Ok(Some("1".into())),
            _ => Ok(None),
        });
        let log = transport.log();
        broker.attach("magnet", Box::new(transport)).await;

        let magnet = Ami430::new(broker, "magnet");
        magnet.set_target(1.5, 0.2).await.unwrap();
        assert_eq!(magnet.state().await.unwrap(), MagnetState::Ramping);
        assert_eq!(
            log.commands(),
            vec![
                "CONFIGURE:RAMP:RATE:FIELD 1,0.2,1;",
                "CONFIGURE:FIELD:TARGET 1.5;",
                "STATE?"
            ]
        );
    }
}
