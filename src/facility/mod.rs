//! Facility Capabilities
//!
//! A facility is one physical measurement site: a cryostat with its magnet,
//! thermometry and the lock-ins wired to the sample. The interpreter and the
//! acquisition engine never talk to instrument drivers directly; they go through
//! the [`Facility`] trait, selected once at startup from configuration.
//!
//! # Design
//!
//! - Every method is async (`#[async_trait]`) and takes `&self`
//! - Implementations hold drivers that share one [`InstrumentBroker`]
//! - Device actions a site cannot perform fall back to default methods that fail
//!   with an error naming the facility
//!
//! Implementations:
//! - [`Bluefors`](bluefors::Bluefors): dilution refrigerator, SR830 lock-ins,
//!   AMI 430 magnet, LakeShore 370 bridge with scanner
//! - [`Cfms`](cfms::Cfms): cryogen-free magnet system driven through MSS
//! - [`StudentInsert`](student_insert::StudentInsert): Keithley 2000, LakeShore
//!   335 and one lock-in
//! - [`BenchFacility`](bench::BenchFacility): no instruments, scripted
//!   readings, for tests and rehearsals

pub mod bench;
pub mod bluefors;
pub mod cfms;
pub mod student_insert;

use crate::config::FacilityConfig;
use crate::hardware::broker::InstrumentBroker;
use crate::hardware::keithley::{DifferentialTrace, SweepStatus};
use crate::hardware::sr830::{Expand, LockinStatus};
use crate::hardware::Direction;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub use crate::hardware::keithley::DeltaSweepSettings as DeltaPlan;

/// Lock-in slots R1..R4 present in every lock-in based layout.
pub const MAX_LOCKINS: usize = 4;

/// Sampling protocol run by the acquisition engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SamplingMode {
    /// Read every channel each tick
    Continuous,
    /// Follow the bridge scanner, one thermometer per tick
    AutoscanFollow,
    /// Continuous readings grouped into averaged steps
    SteppedSweep,
    /// Hardware differential conductance sweep
    DeltaSweep,
}

impl fmt::Display for SamplingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SamplingMode::Continuous => "continuous",
            SamplingMode::AutoscanFollow => "autoscan",
            SamplingMode::SteppedSweep => "step",
            SamplingMode::DeltaSweep => "didv",
        };
        f.write_str(name)
    }
}

/// One column of a sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelSpec {
    /// Column name
    pub name: String,
    /// Unit written in the second header row
    pub unit: String,
}

/// Ordered channel columns for one facility and sampling mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelLayout {
    channels: Vec<ChannelSpec>,
}

impl ChannelLayout {
    /// Empty layout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a column.
    pub fn push(&mut self, name: impl Into<String>, unit: impl Into<String>) -> &mut Self {
        self.channels.push(ChannelSpec {
            name: name.into(),
            unit: unit.into(),
        });
        self
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// True when there are no columns.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Column names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(|c| c.name.as_str())
    }

    /// Column units in order.
    pub fn units(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(|c| c.unit.as_str())
    }

    /// Position of a column by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.channels.iter().position(|c| c.name == name)
    }

    /// All columns.
    pub fn channels(&self) -> &[ChannelSpec] {
        &self.channels
    }
}

/// Quantity stepped by a stepped sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StepParameter {
    /// Lock-in R1 output amplitude
    AmpR1,
    /// Output amplitude of every lock-in
    AmpAll,
    /// Lock-in R1 reference frequency
    Freq,
    /// Gate voltage
    Vg,
    /// Magnetic field
    H,
    /// Mixing chamber heater power
    Heater,
}

impl StepParameter {
    /// Script spelling, also the first aggregate column.
    pub fn name(&self) -> &'static str {
        match self {
            StepParameter::AmpR1 => "AMP-R1",
            StepParameter::AmpAll => "AMP-ALL",
            StepParameter::Freq => "FREQ",
            StepParameter::Vg => "VG",
            StepParameter::H => "H",
            StepParameter::Heater => "HEATER",
        }
    }

    /// Unit of the stepped value.
    pub fn unit(&self) -> &'static str {
        match self {
            StepParameter::AmpR1 | StepParameter::AmpAll | StepParameter::Vg => "V",
            StepParameter::Freq => "Hz",
            StepParameter::H => "T",
            StepParameter::Heater => "uW",
        }
    }
}

impl FromStr for StepParameter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "AMP-R1" => Ok(StepParameter::AmpR1),
            "AMP-ALL" => Ok(StepParameter::AmpAll),
            "FREQ" => Ok(StepParameter::Freq),
            "VG" => Ok(StepParameter::Vg),
            "H" => Ok(StepParameter::H),
            "HEATER" => Ok(StepParameter::Heater),
            other => Err(format!("unknown step parameter '{}'", other)),
        }
    }
}

impl fmt::Display for StepParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lock-in label as used in scripts and logs (`R1`..`R4`).
pub fn lockin_label(index: usize) -> String {
    format!("R{}", index + 1)
}

fn unsupported(facility: &str, action: &str) -> anyhow::Error {
    anyhow!("{}: {} is not supported on this facility", facility, action)
}

/// Everything the interpreter and the acquisition engine need from a site.
#[async_trait]
pub trait Facility: Send + Sync {
    /// Short facility name for logs.
    fn name(&self) -> &'static str;

    /// Columns produced by `read_channels` in `mode`.
    fn layout(&self, mode: SamplingMode) -> ChannelLayout;

    /// Number of configured lock-ins (status checks run for `0..lockin_count`).
    fn lockin_count(&self) -> usize;

    /// One reading per layout column; any failed query fails the whole read.
    async fn read_channels(&self, mode: SamplingMode) -> Result<Vec<Option<f64>>>;

    /// Status byte of lock-in `index`.
    async fn lockin_status(&self, index: usize) -> Result<LockinStatus>;

    /// Raise the sensitivity range of lock-in `index` by one step.
    async fn lockin_range_up(&self, index: usize) -> Result<Option<u8>>;

    /// Protocol preparation done once before the first tick.
    async fn prepare_sampling(&self, mode: SamplingMode) -> Result<()> {
        match mode {
            SamplingMode::AutoscanFollow => Err(unsupported(self.name(), "autoscan sampling")),
            SamplingMode::DeltaSweep => Err(unsupported(self.name(), "differential sweep")),
            _ => Ok(()),
        }
    }

    /// Gate source level in volts.
    async fn set_gate_voltage(&self, _volts: f64) -> Result<()> {
        Err(unsupported(self.name(), "gate voltage"))
    }

    /// Gate source level in amperes.
    async fn set_gate_current(&self, _amps: f64) -> Result<()> {
        Err(unsupported(self.name(), "gate current"))
    }

    /// Gate source output on/off.
    async fn set_gate_output(&self, _on: bool) -> Result<()> {
        Err(unsupported(self.name(), "gate output"))
    }

    /// Start ramping the magnet to `tesla`.
    async fn set_target_field(&self, _tesla: f64, _rate_t_per_min: f64) -> Result<()> {
        Err(unsupported(self.name(), "field control"))
    }

    /// True while the magnet is ramping.
    async fn magnet_ramping(&self) -> Result<bool> {
        Err(unsupported(self.name(), "field control"))
    }

    /// Start ramping the sample temperature to `kelvin`.
    async fn set_target_temperature(&self, _kelvin: f64, _rate_k_per_min: f64) -> Result<()> {
        Err(unsupported(self.name(), "temperature control"))
    }

    /// True while the temperature setpoint is ramping.
    async fn temperature_ramping(&self) -> Result<bool> {
        Err(unsupported(self.name(), "temperature control"))
    }

    /// Output amplitude of lock-in `index`.
    async fn set_amplitude(&self, _index: usize, _volts: f64) -> Result<()> {
        Err(unsupported(self.name(), "lock-in amplitude"))
    }

    /// Reference frequency of lock-in `index`.
    async fn set_frequency(&self, _index: usize, _hertz: f64) -> Result<()> {
        Err(unsupported(self.name(), "lock-in frequency"))
    }

    /// Auto-offset and expand R of lock-in `index`; `None` switches both off.
    async fn set_offset_expand(&self, _index: usize, _expand: Option<Expand>) -> Result<()> {
        Err(unsupported(self.name(), "offset and expand"))
    }

    /// Point the thermometry scanner at `channel`.
    async fn select_tc_channel(&self, _channel: u8, _autoscan: bool) -> Result<()> {
        Err(unsupported(self.name(), "scanner channel selection"))
    }

    /// Step the excitation of the channel the scanner is on.
    async fn step_tc_excitation(&self, _direction: Direction) -> Result<Option<u8>> {
        Err(unsupported(self.name(), "excitation control"))
    }

    /// Step the resistance range of `channel`.
    async fn step_tc_range(&self, _channel: u8, _direction: Direction) -> Result<Option<u8>> {
        Err(unsupported(self.name(), "range control"))
    }

    /// Manual heater output in microwatts.
    async fn set_heater(&self, _microwatts: f64) -> Result<()> {
        Err(unsupported(self.name(), "heater control"))
    }

    /// Configure, arm and trigger a differential conductance sweep.
    async fn arm_differential_sweep(&self, _plan: &DeltaPlan) -> Result<()> {
        Err(unsupported(self.name(), "differential sweep"))
    }

    /// Status register of the running sweep.
    async fn sweep_status(&self) -> Result<SweepStatus> {
        Err(unsupported(self.name(), "differential sweep"))
    }

    /// Export the buffered sweep.
    async fn fetch_differential_trace(&self) -> Result<DifferentialTrace> {
        Err(unsupported(self.name(), "differential sweep"))
    }

    /// Abort the running sweep.
    async fn abort_sweep(&self) -> Result<()> {
        Err(unsupported(self.name(), "differential sweep"))
    }
}

/// Build the facility named in the configuration on top of `broker`.
pub fn build(config: &FacilityConfig, broker: Arc<InstrumentBroker>) -> Arc<dyn Facility> {
    match config {
        FacilityConfig::Bluefors(site) => Arc::new(bluefors::Bluefors::new(site, broker)),
        FacilityConfig::Cfms(site) => Arc::new(cfms::Cfms::new(site, broker)),
        FacilityConfig::StudentInsert(site) => {
            Arc::new(student_insert::StudentInsert::new(site, broker))
        }
    }
}

/// Push `U{n}`/`Phase{n}` columns for all lock-in slots.
pub(crate) fn push_lockin_columns(layout: &mut ChannelLayout, first_measures_current: bool) {
    for slot in 0..MAX_LOCKINS {
        let n = slot + 1;
        if slot == 0 && first_measures_current {
            layout.push("I1", "A");
        } else {
            layout.push(format!("U{}", n), "V");
        }
        layout.push(format!("Phase{}", n), "deg");
    }
}

/// Read R and theta of every configured lock-in; unconfigured slots are missing.
pub(crate) async fn read_lockin_slots(
    lockins: &[crate::hardware::sr830::Sr830],
    values: &mut Vec<Option<f64>>,
) -> Result<()> {
    for slot in 0..MAX_LOCKINS {
        match lockins.get(slot) {
            Some(lockin) => {
                let (r, theta) = lockin.r_theta().await?;
                values.push(Some(r));
                values.push(Some(theta));
            }
            None => {
                values.push(None);
                values.push(None);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_parameter_parse() {
        assert_eq!("amp-all".parse::<StepParameter>(), Ok(StepParameter::AmpAll));
        assert_eq!("Heater".parse::<StepParameter>(), Ok(StepParameter::Heater));
        assert!("TEMP".parse::<StepParameter>().is_err());
    }

    #[test]
    fn test_lockin_columns() {
        let mut layout = ChannelLayout::new();
        push_lockin_columns(&mut layout, true);
        let names: Vec<_> = layout.names().collect();
        assert_eq!(names[0], "I1");
        assert_eq!(names[2], "U2");
        assert_eq!(layout.len(), 8);
        assert_eq!(layout.index_of("Phase4"), Some(7));
    }
}
