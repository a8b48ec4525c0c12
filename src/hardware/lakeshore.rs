//! LakeShore temperature instruments.
//!
//! - `LakeShore370`: AC resistance bridge with an eight-channel scanner. Channels 1-6
//!   carry calibrated thermometers (`RDGK?`), 7 and 8 are read as raw resistance
//!   (`RDGR?`). `SCAN?` reports the channel currently connected and whether the
//!   scanner is cycling (autoscan).
//! - `LakeShore335`: two-input controller used on the student insert.

use crate::hardware::broker::InstrumentBroker;
use crate::hardware::Direction;
use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;

/// Excitation and range indices are 1-based and top out at 22.
pub const MAX_RANGE_INDEX: u8 = 22;

/// Pause the 370 needs between `RAMP` and `SETP`.
const SETPOINT_SETTLE: Duration = Duration::from_millis(500);

/// `RDGRNG?` reply for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSettings {
    /// 0 = voltage excitation, 1 = current excitation
    pub mode: u8,
    /// Excitation index 1..=22
    pub excitation: u8,
    /// Resistance range index 1..=22
    pub range: u8,
    /// Autorange on/off
    pub autorange: u8,
    /// Excitation off flag
    pub excitation_off: u8,
}

impl RangeSettings {
    fn to_command(self, channel: u8) -> String {
        format!(
            "RDGRNG {},{},{},{},{},{}",
            channel, self.mode, self.excitation, self.range, self.autorange, self.excitation_off
        )
    }
}

fn parse_scan(id: &str, values: &[f64]) -> Result<(u8, bool)> {
    match values {
        [channel, autoscan] => Ok((*channel as u8, *autoscan != 0.0)),
        other => Err(anyhow!(
            "{}: expected 2 values from SCAN?, got {}",
            id,
            other.len()
        )),
    }
}

fn step_index(index: u8, direction: Direction) -> Option<u8> {
    match direction {
        Direction::Up if index < MAX_RANGE_INDEX => Some(index + 1),
        Direction::Down if index > 1 => Some(index - 1),
        _ => None,
    }
}

/// What a scanner channel reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    /// Calibrated temperature (`RDGK?`)
    Kelvin,
    /// Raw resistance (`RDGR?`)
    Ohms,
}

impl Quantity {
    fn query(self, channel: u8) -> String {
        match self {
            Quantity::Kelvin => format!("RDGK? {}", channel),
            Quantity::Ohms => format!("RDGR? {}", channel),
        }
    }
}

/// LakeShore 370 resistance bridge.
#[derive(Clone)]
pub struct LakeShore370 {
    broker: Arc<InstrumentBroker>,
    id: String,
}

impl LakeShore370 {
    /// Driver for the bridge attached under `id`.
    pub fn new(broker: Arc<InstrumentBroker>, id: impl Into<String>) -> Self {
        Self {
            broker,
            id: id.into(),
        }
    }

    /// Channel the scanner is on and whether autoscan is enabled.
    pub async fn scanner(&self) -> Result<(u8, bool)> {
        let values = self.broker.query_values(&self.id, "SCAN?").await?;
        parse_scan(&self.id, &values)
    }

    /// Read the scanner channel and, in the same bus transaction, the reading
    /// `pick` chooses for it. The scanner cannot move between the two queries.
    pub async fn read_scanned(
        &self,
        pick: impl FnOnce(u8) -> Option<(u8, Quantity)>,
    ) -> Result<(u8, Option<f64>)> {
        let mut bus = self.broker.lock().await;
        let values = bus.query_values(&self.id, "SCAN?").await?;
        let (channel, _) = parse_scan(&self.id, &values)?;
        let Some((target, quantity)) = pick(channel) else {
            return Ok((channel, None));
        };
        let command = quantity.query(target);
        let reading = bus
            .query_values(&self.id, &command)
            .await?
            .first()
            .copied()
            .ok_or_else(|| anyhow!("{}: empty reply to '{}'", self.id, command))?;
        Ok((channel, Some(reading)))
    }

    /// Point the scanner at `channel`.
    pub async fn select_channel(&self, channel: u8, autoscan: bool) -> Result<()> {
        self.broker
            .write(&self.id, &format!("SCAN {},{}", channel, u8::from(autoscan)))
            .await
    }

    /// Raw resistance of a channel, in ohm.
    pub async fn ohms(&self, channel: u8) -> Result<f64> {
        self.single(&Quantity::Ohms.query(channel)).await
    }

    /// Set the control setpoint, ramping at `rate_k_per_min` when given.
    pub async fn set_setpoint(&self, kelvin: f64, rate_k_per_min: Option<f64>) -> Result<()> {
        let ramp = match rate_k_per_min {
            Some(rate) => format!("RAMP 1,{}", rate),
            None => "RAMP 0,0".to_string(),
        };
        self.broker.write(&self.id, &ramp).await?;
        tokio::time::sleep(SETPOINT_SETTLE).await;
        self.broker
            .write(&self.id, &format!("SETP {}", kelvin))
            .await
    }

    /// Whether the setpoint ramp is in progress.
    pub async fn ramping(&self) -> Result<bool> {
        Ok(self.single("RAMPST?").await? != 0.0)
    }

    /// Read excitation/range settings of a channel.
    pub async fn range_settings(&self, channel: u8) -> Result<RangeSettings> {
        let values = self
            .broker
            .query_values(&self.id, &format!("RDGRNG? {}", channel))
            .await?;
        parse_range_settings(&self.id, &values)
    }

    /// Step the excitation of `channel`; `None` when already at the limit.
    pub async fn step_excitation(&self, channel: u8, direction: Direction) -> Result<Option<u8>> {
        let mut bus = self.broker.lock().await;
        let values = bus
            .query_values(&self.id, &format!("RDGRNG? {}", channel))
            .await?;
        let mut settings = parse_range_settings(&self.id, &values)?;
        let Some(next) = step_index(settings.excitation, direction) else {
            return Ok(None);
        };
        settings.excitation = next;
        bus.write(&self.id, &settings.to_command(channel)).await?;
        Ok(Some(next))
    }

    /// Step the resistance range of `channel`; `None` when already at the limit.
    pub async fn step_range(&self, channel: u8, direction: Direction) -> Result<Option<u8>> {
        let mut bus = self.broker.lock().await;
        let values = bus
            .query_values(&self.id, &format!("RDGRNG? {}", channel))
            .await?;
        let mut settings = parse_range_settings(&self.id, &values)?;
        let Some(next) = step_index(settings.range, direction) else {
            return Ok(None);
        };
        settings.range = next;
        bus.write(&self.id, &settings.to_command(channel)).await?;
        Ok(Some(next))
    }

    /// Manual heater output in microwatts.
    pub async fn set_heater(&self, microwatts: f64) -> Result<()> {
        self.broker
            .write(&self.id, &format!("MOUT {}", microwatts * 1e-6))
            .await
    }

    async fn single(&self, command: &str) -> Result<f64> {
        self.broker
            .query_values(&self.id, command)
            .await?
            .first()
            .copied()
            .ok_or_else(|| anyhow!("{}: empty reply to '{}'", self.id, command))
    }
}

fn parse_range_settings(id: &str, values: &[f64]) -> Result<RangeSettings> {
    match values {
        [mode, excitation, range, autorange, off] => Ok(RangeSettings {
            mode: *mode as u8,
            excitation: *excitation as u8,
            range: *range as u8,
            autorange: *autorange as u8,
            excitation_off: *off as u8,
        }),
        other => Err(anyhow!(
            "{}: expected 5 values from RDGRNG?, got {}",
            id,
            other.len()
        )),
    }
}

/// LakeShore 335 two-input controller.
#[derive(Clone)]
pub struct LakeShore335 {
    broker: Arc<InstrumentBroker>,
    id: String,
}

impl LakeShore335 {
    /// Driver for the controller attached under `id`.
    pub fn new(broker: Arc<InstrumentBroker>, id: impl Into<String>) -> Self {
        Self {
            broker,
            id: id.into(),
        }
    }

    /// Temperature of input `A` or `B`, in kelvin.
    pub async fn kelvin(&self, input: char) -> Result<f64> {
        let command = format!("KRDG? {}", input);
        self.broker
            .query_values(&self.id, &command)
            .await?
            .first()
            .copied()
            .ok_or_else(|| anyhow!("{}: empty reply to '{}'", self.id, command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{simulated, CommandLog, SimulatedModel};

    async fn bridge() -> (LakeShore370, CommandLog) {
        let broker = Arc::new(InstrumentBroker::new());
        let transport = simulated(SimulatedModel::LakeShore370);
        let log = transport.log();
        broker.attach("tc", Box::new(transport)).await;
        (LakeShore370::new(broker, "tc"), log)
    }

    #[test]
    fn test_step_index_limits() {
        assert_eq!(step_index(22, Direction::Up), None);
        assert_eq!(step_index(1, Direction::Down), None);
        assert_eq!(step_index(5, Direction::Up), Some(6));
        assert_eq!(step_index(5, Direction::Down), Some(4));
    }

    #[tokio::test]
    async fn test_scanner_reply() {
        let (bridge, _log) = bridge().await;
        assert_eq!(bridge.scanner().await.unwrap(), (6, false));
        bridge.select_channel(3, true).await.unwrap();
        assert_eq!(bridge.scanner().await.unwrap(), (3, true));
    }

    #[tokio::test]
    async fn test_read_scanned_follows_the_scanner() {
        let (bridge, log) = bridge().await;
        bridge.select_channel(7, false).await.unwrap();
        let (channel, reading) = bridge
            .read_scanned(|channel| Some((channel, Quantity::Ohms)))
            .await
            .unwrap();
        assert_eq!(channel, 7);
        assert!(reading.is_some());
        assert_eq!(log.commands(), vec!["SCAN 7,0", "SCAN?", "RDGR? 7"]);

        let (channel, reading) = bridge.read_scanned(|_| None).await.unwrap();
        assert_eq!((channel, reading), (7, None));
    }

    #[tokio::test]
    async fn test_step_range_rewrites_only_range() {
        let (bridge, log) = bridge().await;
        assert_eq!(bridge.step_range(7, Direction::Up).await.unwrap(), Some(11));
        assert_eq!(
            log.commands(),
            vec!["RDGRNG? 7", "RDGRNG 7,0,5,11,0,0"]
        );
        let settings = bridge.range_settings(7).await.unwrap();
        assert_eq!(settings.excitation, 5);
        assert_eq!(settings.range, 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_setpoint_with_ramp() {
        let (bridge, log) = bridge().await;
        bridge.set_setpoint(0.05, Some(0.002)).await.unwrap();
        assert_eq!(log.commands(), vec!["RAMP 1,0.002", "SETP 0.05"]);
        assert!(!bridge.ramping().await.unwrap());
    }
}
