//! Keithley instruments.
//!
//! - `Keithley2000`: multimeter, last reading via `:DATA?`
//! - `Keithley6430`: source-measure unit, `:READ?` returns voltage, current,
//!   resistance, time, status; resistance is the third field
//! - `Keithley6221`: current source running the hardware differential conductance
//!   sweep ("delta mode") and buffering the result in its trace memory

use crate::hardware::broker::InstrumentBroker;
use anyhow::{anyhow, bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Keithley 2000 multimeter.
#[derive(Clone)]
pub struct Keithley2000 {
    broker: Arc<InstrumentBroker>,
    id: String,
}

impl Keithley2000 {
    /// Driver for the meter attached under `id`.
    pub fn new(broker: Arc<InstrumentBroker>, id: impl Into<String>) -> Self {
        Self {
            broker,
            id: id.into(),
        }
    }

    /// Latest reading (ohm when in resistance mode).
    pub async fn reading(&self) -> Result<f64> {
        self.broker
            .query_values(&self.id, ":DATA?")
            .await?
            .first()
            .copied()
            .ok_or_else(|| anyhow!("{}: empty :DATA? reply", self.id))
    }
}

/// Keithley 6430 source-measure unit.
#[derive(Clone)]
pub struct Keithley6430 {
    broker: Arc<InstrumentBroker>,
    id: String,
}

impl Keithley6430 {
    /// Driver for the SMU attached under `id`.
    pub fn new(broker: Arc<InstrumentBroker>, id: impl Into<String>) -> Self {
        Self {
            broker,
            id: id.into(),
        }
    }

    /// Measured resistance in ohm.
    pub async fn resistance(&self) -> Result<f64> {
        let values = self.broker.query_values(&self.id, ":READ?").await?;
        values
            .get(2)
            .copied()
            .ok_or_else(|| anyhow!("{}: :READ? returned {} fields", self.id, values.len()))
    }
}

const ARM_POLL: Duration = Duration::from_millis(500);
const ARM_ATTEMPTS: u32 = 20;

/// Differential conductance sweep settings, currents in amperes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeltaSweepSettings {
    /// First current of the sweep
    pub start: f64,
    /// Last current of the sweep
    pub stop: f64,
    /// Number of points
    pub points: u32,
    /// Differential current amplitude
    pub delta: f64,
}

impl DeltaSweepSettings {
    /// Current increment between points.
    pub fn step(&self) -> f64 {
        (self.stop - self.start) / f64::from(self.points.max(1))
    }
}

/// Decoded `STAT:OPER:COND?` register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepStatus(pub u16);

impl SweepStatus {
    /// Instrument is calibrating.
    pub fn calibrating(&self) -> bool {
        self.0 & 0b1 != 0
    }

    /// Sweep finished.
    pub fn sweep_done(&self) -> bool {
        self.0 & 0b10 != 0
    }

    /// Sweep running.
    pub fn sweeping(&self) -> bool {
        self.0 & 0b1000 != 0
    }
}

/// Buffered result of a differential conductance sweep.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DifferentialTrace {
    /// Voltmeter offset at zero current
    pub zero_voltage: f64,
    /// `(dV/dI in ohm, time in s)` per point
    pub points: Vec<(f64, f64)>,
}

/// Keithley 6221 current source.
#[derive(Clone)]
pub struct Keithley6221 {
    broker: Arc<InstrumentBroker>,
    id: String,
}

impl Keithley6221 {
    /// Driver for the source attached under `id`.
    pub fn new(broker: Arc<InstrumentBroker>, id: impl Into<String>) -> Self {
        Self {
            broker,
            id: id.into(),
        }
    }

    /// Reset, configure, arm and trigger a differential conductance sweep.
    ///
    /// Fails if the instrument does not report armed within ten seconds.
    pub async fn start_differential_sweep(&self, settings: &DeltaSweepSettings) -> Result<()> {
        let setup = [
            "*RST".to_string(),
            "UNIT OHMS".to_string(),
            format!("SOUR:DCON:STAR {}", settings.start),
            format!("SOUR:DCON:STOP {}", settings.stop),
            format!("SOUR:DCON:STEP {}", settings.step()),
            format!("SOUR:DCON:DELT {}", settings.delta),
            "SOUR:DCON:DEL 50e-3".to_string(),
            "SOUR:DCON:CAB OFF".to_string(),
            format!("TRAC:POIN {}", settings.points),
            "SOUR:DCON:ARM".to_string(),
        ];
        for command in &setup {
            self.broker.write(&self.id, command).await?;
        }

        for _ in 0..ARM_ATTEMPTS {
            let reply = self.broker.query(&self.id, "SOUR:DCON:ARM?").await?;
            if reply.trim().parse::<f64>().unwrap_or(0.0) != 0.0 {
                self.broker.write(&self.id, "INIT:IMM").await?;
                return Ok(());
            }
            debug!(instrument = %self.id, "Waiting for delta sweep to arm");
            sleep(ARM_POLL).await;
        }
        bail!("{}: differential sweep did not arm", self.id)
    }

    /// Operation condition register.
    pub async fn status(&self) -> Result<SweepStatus> {
        let reply = self.broker.query(&self.id, "STAT:OPER:COND?").await?;
        let raw = reply
            .trim()
            .parse::<u16>()
            .with_context(|| format!("{}: bad STAT:OPER:COND? reply '{}'", self.id, reply))?;
        Ok(SweepStatus(raw))
    }

    /// Zero-voltage reading and the buffered trace.
    pub async fn fetch_trace(&self) -> Result<DifferentialTrace> {
        let zero_voltage = self
            .broker
            .query_values(&self.id, "SOUR:DCON:NVZ?")
            .await?
            .first()
            .copied()
            .ok_or_else(|| anyhow!("{}: empty SOUR:DCON:NVZ? reply", self.id))?;
        let raw = self.broker.query_values(&self.id, "TRAC:DATA?").await?;
        if raw.len() % 2 != 0 {
            bail!("{}: odd number of values in trace ({})", self.id, raw.len());
        }
        let points = raw.chunks(2).map(|pair| (pair[0], pair[1])).collect();
        Ok(DifferentialTrace {
            zero_voltage,
            points,
        })
    }

    /// Abort any running sweep.
    pub async fn abort(&self) -> Result<()> {
        self.broker.write(&self.id, "SOUR:SWE:ABOR").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{simulated, SimulatedModel};

    #[test]
    fn test_sweep_status_bits() {
        let status = SweepStatus(0b1010);
        assert!(status.sweep_done());
        assert!(status.sweeping());
        assert!(!status.calibrating());
    }

    #[test]
    fn test_step_size() {
        let settings = DeltaSweepSettings {
            start: -1e-6,
            stop: 1e-6,
            points: 4,
            delta: 1e-8,
        };
        assert!((settings.step() - 0.5e-6).abs() < 1e-18);
    }

    #[tokio::test(start_paused = true)]
    async fn test_differential_sweep_round() {
        let broker = Arc::new(InstrumentBroker::new());
        let transport = simulated(SimulatedModel::Keithley6221);
        let log = transport.log();
        broker.attach("k6221", Box::new(transport)).await;
        let source = Keithley6221::new(broker, "k6221");

        let settings = DeltaSweepSettings {
            start: 0.0,
            stop: 3e-6,
            points: 3,
            delta: 1e-7,
        };
        source.start_differential_sweep(&settings).await.unwrap();
        assert!(source.status().await.unwrap().sweep_done());

        let trace = source.fetch_trace().await.unwrap();
        assert_eq!(trace.points.len(), 3);
        assert_eq!(trace.points[1], (101.0, 0.05));
        assert!((trace.zero_voltage - 1.5e-6).abs() < 1e-12);

        source.abort().await.unwrap();
        assert_eq!(log.count("INIT:IMM"), 1);
        assert_eq!(log.commands().last().unwrap(), "SOUR:SWE:ABOR");
    }
}
