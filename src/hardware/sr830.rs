//! Stanford Research SR830 lock-in amplifier.
//!
//! Protocol notes:
//! - `SNAP? 3,4` reads R and theta in one acquisition (consistent pair)
//! - `LIAS?` returns the status byte: bit 0 input/reserve overload, bit 1 time-constant
//!   filter overload, bit 2 output overload
//! - Sensitivity is an index 0..=26 (2 nV .. 1 V full scale); `SENS n` sets it
//! - Offset and expand act on output 3 (R): `AOFF 3` auto-offsets, `OEXP 3,o,e` sets
//!   offset percent and expand code (0 = 1x, 1 = 10x, 2 = 100x)

use crate::hardware::broker::InstrumentBroker;
use anyhow::{anyhow, bail, Context, Result};
use std::fmt;
use std::sync::Arc;

/// Highest sensitivity index (1 V full scale).
pub const MAX_SENSITIVITY: u8 = 26;

const STATUS_INPUT_OVERLOAD: u8 = 0b001;
const STATUS_FILTER_OVERLOAD: u8 = 0b010;
const STATUS_OUTPUT_OVERLOAD: u8 = 0b100;

/// Decoded `LIAS?` status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockinStatus(pub u8);

impl LockinStatus {
    /// Input or reserve overload.
    pub fn input_overload(&self) -> bool {
        self.0 & STATUS_INPUT_OVERLOAD != 0
    }

    /// Time-constant filter overload.
    pub fn filter_overload(&self) -> bool {
        self.0 & STATUS_FILTER_OVERLOAD != 0
    }

    /// Output overload; the signal exceeds the sensitivity range.
    pub fn output_overload(&self) -> bool {
        self.0 & STATUS_OUTPUT_OVERLOAD != 0
    }

    /// No overload flag set.
    pub fn is_clear(&self) -> bool {
        self.0 & (STATUS_INPUT_OVERLOAD | STATUS_FILTER_OVERLOAD | STATUS_OUTPUT_OVERLOAD) == 0
    }
}

impl fmt::Display for LockinStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut flags = Vec::new();
        if self.input_overload() {
            flags.push("I/S");
        }
        if self.filter_overload() {
            flags.push("TC");
        }
        if self.output_overload() {
            flags.push("OUT");
        }
        if flags.is_empty() {
            write!(f, "OK")
        } else {
            write!(f, "{} overload", flags.join("+"))
        }
    }
}

/// Output expand factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expand {
    /// No expansion
    X1,
    /// 10x
    X10,
    /// 100x
    X100,
}

impl Expand {
    /// Parse `1x`, `10x` or `100x` (case-insensitive).
    pub fn parse(text: &str) -> Option<Self> {
        match text.to_lowercase().as_str() {
            "1x" => Some(Expand::X1),
            "10x" => Some(Expand::X10),
            "100x" => Some(Expand::X100),
            _ => None,
        }
    }

    fn code(self) -> u8 {
        match self {
            Expand::X1 => 0,
            Expand::X10 => 1,
            Expand::X100 => 2,
        }
    }
}

impl fmt::Display for Expand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expand::X1 => write!(f, "1x"),
            Expand::X10 => write!(f, "10x"),
            Expand::X100 => write!(f, "100x"),
        }
    }
}

/// SR830 driver; every call is one broker transaction unless noted.
#[derive(Clone)]
pub struct Sr830 {
    broker: Arc<InstrumentBroker>,
    id: String,
}

impl Sr830 {
    /// Driver for the lock-in attached under `id`.
    pub fn new(broker: Arc<InstrumentBroker>, id: impl Into<String>) -> Self {
        Self {
            broker,
            id: id.into(),
        }
    }

    /// Instrument id on the bus.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Amplitude R (V) and phase theta (deg).
    pub async fn r_theta(&self) -> Result<(f64, f64)> {
        let values = self.broker.query_values(&self.id, "SNAP? 3,4").await?;
        match values.as_slice() {
            [r, theta] => Ok((*r, *theta)),
            other => Err(anyhow!(
                "{}: expected 2 values from SNAP?, got {}",
                self.id,
                other.len()
            )),
        }
    }

    /// X, Y, R, theta in one snapshot.
    pub async fn xy_r_theta(&self) -> Result<[f64; 4]> {
        let values = self.broker.query_values(&self.id, "SNAP? 1,2,3,4").await?;
        match values.as_slice() {
            [x, y, r, theta] => Ok([*x, *y, *r, *theta]),
            other => Err(anyhow!(
                "{}: expected 4 values from SNAP?, got {}",
                self.id,
                other.len()
            )),
        }
    }

    /// Overload status byte.
    pub async fn status(&self) -> Result<LockinStatus> {
        let reply = self.broker.query(&self.id, "LIAS?").await?;
        let raw = reply
            .trim()
            .parse::<u8>()
            .with_context(|| format!("{}: bad LIAS? reply '{}'", self.id, reply))?;
        Ok(LockinStatus(raw))
    }

    /// Current sensitivity index.
    pub async fn sensitivity(&self) -> Result<u8> {
        let reply = self.broker.query(&self.id, "SENS?").await?;
        reply
            .trim()
            .parse::<u8>()
            .with_context(|| format!("{}: bad SENS? reply '{}'", self.id, reply))
    }

    /// Increase the sensitivity range by one step. Returns the new index, or
    /// `None` when already at the top range.
    pub async fn range_up(&self) -> Result<Option<u8>> {
        let current = self.sensitivity().await?;
        if current >= MAX_SENSITIVITY {
            return Ok(None);
        }
        let next = current + 1;
        self.broker
            .write(&self.id, &format!("SENS {}", next))
            .await?;
        Ok(Some(next))
    }

    /// Sine output amplitude, 0.004..=5 V.
    pub async fn set_amplitude(&self, volts: f64) -> Result<()> {
        if !(0.004..=5.0).contains(&volts) {
            bail!("{}: amplitude {} V outside 0.004..5 V", self.id, volts);
        }
        self.broker
            .write(&self.id, &format!("SLVL {}", volts))
            .await
    }

    /// Reference frequency, 0.001..=102000 Hz.
    pub async fn set_frequency(&self, hertz: f64) -> Result<()> {
        if !(0.001..=102_000.0).contains(&hertz) {
            bail!("{}: frequency {} Hz outside 0.001..102000 Hz", self.id, hertz);
        }
        self.broker
            .write(&self.id, &format!("FREQ {}", hertz))
            .await
    }

    /// Auto-offset R and apply `expand`; returns the offset in percent.
    ///
    /// Runs under one bus acquisition so the offset read back is the one just set.
    pub async fn enable_offset_expand(&self, expand: Expand) -> Result<f64> {
        let mut bus = self.broker.lock().await;
        bus.write(&self.id, "AOFF 3").await?;
        let values = bus.query_values(&self.id, "OEXP? 3").await?;
        let offset = match values.as_slice() {
            [offset, _] => *offset,
            other => bail!(
                "{}: expected 2 values from OEXP?, got {}",
                self.id,
                other.len()
            ),
        };
        bus.write(&self.id, &format!("OEXP 3,{},{}", offset, expand.code()))
            .await?;
        Ok(offset)
    }

    /// Remove offset and expand from R.
    pub async fn disable_offset_expand(&self) -> Result<()> {
        self.broker.write(&self.id, "OEXP 3,0,0").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{simulated, SimulatedModel};

    #[test]
    fn test_status_decoding() {
        let status = LockinStatus(0b101);
        assert!(status.input_overload());
        assert!(!status.filter_overload());
        assert!(status.output_overload());
        assert!(!status.is_clear());
        assert_eq!(status.to_string(), "I/S+OUT overload");
        assert!(LockinStatus(0).is_clear());
        assert!(LockinStatus(0b1000).is_clear());
    }

    #[test]
    fn test_expand_parse() {
        assert_eq!(Expand::parse("10X"), Some(Expand::X10));
        assert_eq!(Expand::parse("1000x"), None);
    }

    async fn lockin() -> (Sr830, crate::hardware::mock::CommandLog) {
        let broker = Arc::new(InstrumentBroker::new());
        let transport = simulated(SimulatedModel::Sr830);
        let log = transport.log();
        broker.attach("r1", Box::new(transport)).await;
        (Sr830::new(broker, "r1"), log)
    }

    #[tokio::test]
    async fn test_range_up_stops_at_top() {
        let (lockin, log) = lockin().await;
        assert_eq!(lockin.range_up().await.unwrap(), Some(21));
        lockin.broker.write("r1", "SENS 26").await.unwrap();
        assert_eq!(lockin.range_up().await.unwrap(), None);
        assert_eq!(log.count("SENS "), 2);
    }

    #[tokio::test]
    async fn test_offset_expand_sequence() {
        let (lockin, log) = lockin().await;
        let offset = lockin.enable_offset_expand(Expand::X100).await.unwrap();
        assert_eq!(offset, 40.0);
        assert_eq!(log.commands(), vec!["AOFF 3", "OEXP? 3", "OEXP 3,40,2"]);
    }

    #[tokio::test]
    async fn test_amplitude_bounds() {
        let (lockin, log) = lockin().await;
        assert!(lockin.set_amplitude(10.0).await.is_err());
        lockin.set_amplitude(0.1).await.unwrap();
        assert_eq!(log.commands(), vec!["SLVL 0.1"]);
        let (r, _theta) = lockin.r_theta().await.unwrap();
        assert!((r - 1e-4).abs() < 1e-12);
    }
}
