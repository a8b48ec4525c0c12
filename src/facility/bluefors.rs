//! Bluefors dilution refrigerator.
//!
//! Thermometry runs through a LakeShore 370 whose scanner visits one channel at a
//! time. In continuous sampling only the channel the scanner is parked on is
//! read: channel 6 is the mixing chamber (`T`, kelvin), channels 7 and 8 are raw
//! resistances. Autoscan sampling stores each reading in its own column and
//! leaves the others missing.

use super::{
    push_lockin_columns, read_lockin_slots, ChannelLayout, DeltaPlan, Facility, SamplingMode,
};
use crate::config::BlueforsConfig;
use crate::hardware::ami430::{Ami430, MagnetState};
use crate::hardware::broker::InstrumentBroker;
use crate::hardware::keithley::{DifferentialTrace, Keithley6221, Keithley6430, SweepStatus};
use crate::hardware::lakeshore::{LakeShore370, Quantity};
use crate::hardware::sr830::{Expand, LockinStatus, Sr830};
use crate::hardware::yokogawa::Yokogawa;
use crate::hardware::Direction;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Scanner channels with a calibrated thermometer.
const KELVIN_CHANNELS: [u8; 5] = [1, 2, 3, 5, 6];
/// Mixing chamber channel.
const MIXING_CHAMBER: u8 = 6;
/// Thermometer read instead of the mixing chamber when the PT flange is selected.
const PT_FLANGE: u8 = 2;
/// Bridge channel carrying the Hall sensor.
const HALL_CHANNEL: u8 = 8;

/// Bluefors facility.
pub struct Bluefors {
    lockins: Vec<Sr830>,
    magnet: Option<Ami430>,
    bridge: LakeShore370,
    gate: Option<Yokogawa>,
    resistance_meter: Option<Keithley6430>,
    current_source: Option<Keithley6221>,
    measure_hall: bool,
    pt_flange: bool,
    first_lockin_measures_current: bool,
}

impl Bluefors {
    /// Facility using the instruments named in `config`.
    pub fn new(config: &BlueforsConfig, broker: Arc<InstrumentBroker>) -> Self {
        Self {
            lockins: config
                .lockins
                .iter()
                .map(|id| Sr830::new(Arc::clone(&broker), id.clone()))
                .collect(),
            magnet: config
                .magnet
                .as_ref()
                .map(|id| Ami430::new(Arc::clone(&broker), id.clone())),
            bridge: LakeShore370::new(Arc::clone(&broker), config.bridge.clone()),
            gate: config
                .gate
                .as_ref()
                .map(|id| Yokogawa::new(Arc::clone(&broker), id.clone())),
            resistance_meter: config
                .resistance_meter
                .as_ref()
                .map(|id| Keithley6430::new(Arc::clone(&broker), id.clone())),
            current_source: config
                .current_source
                .as_ref()
                .map(|id| Keithley6221::new(Arc::clone(&broker), id.clone())),
            measure_hall: config.measure_hall,
            pt_flange: config.pt_flange,
            first_lockin_measures_current: config.first_lockin_measures_current,
        }
    }

    fn lockin(&self, index: usize) -> Result<&Sr830> {
        self.lockins
            .get(index)
            .ok_or_else(|| anyhow!("bluefors: lock-in R{} is not configured", index + 1))
    }

    fn magnet(&self) -> Result<&Ami430> {
        self.magnet
            .as_ref()
            .ok_or_else(|| anyhow!("bluefors: no magnet configured"))
    }

    fn current_source(&self) -> Result<&Keithley6221> {
        self.current_source
            .as_ref()
            .ok_or_else(|| anyhow!("bluefors: no current source configured"))
    }

    async fn read_common(&self, values: &mut Vec<Option<f64>>) -> Result<()> {
        read_lockin_slots(&self.lockins, values).await?;
        values.push(match &self.magnet {
            Some(magnet) => Some(magnet.field().await?),
            None => None,
        });
        values.push(if self.measure_hall {
            Some(self.bridge.ohms(HALL_CHANNEL).await?)
        } else {
            None
        });
        Ok(())
    }
}

#[async_trait]
impl Facility for Bluefors {
    fn name(&self) -> &'static str {
        "bluefors"
    }

    fn layout(&self, mode: SamplingMode) -> ChannelLayout {
        let mut layout = ChannelLayout::new();
        push_lockin_columns(&mut layout, self.first_lockin_measures_current);
        layout.push("H", "T").push("Hall", "Ohm");
        match mode {
            SamplingMode::AutoscanFollow => {
                for channel in KELVIN_CHANNELS {
                    layout.push(format!("T{}", channel), "K");
                }
                layout.push("T7", "Ohm").push("T8", "Ohm");
            }
            _ => {
                layout
                    .push("T", "K")
                    .push("T7", "Ohm")
                    .push("T8", "Ohm")
                    .push("RK", "Ohm");
            }
        }
        layout
    }

    fn lockin_count(&self) -> usize {
        self.lockins.len()
    }

    async fn read_channels(&self, mode: SamplingMode) -> Result<Vec<Option<f64>>> {
        let mut values = Vec::with_capacity(self.layout(mode).len());
        self.read_common(&mut values).await?;

        if mode == SamplingMode::AutoscanFollow {
            let (channel, reading) = self
                .bridge
                .read_scanned(|channel| match channel {
                    1 | 2 | 3 | 5 | 6 => Some((channel, Quantity::Kelvin)),
                    7 | 8 => Some((channel, Quantity::Ohms)),
                    _ => None,
                })
                .await?;
            let mut slots = [None; 7];
            match channel {
                1 | 2 | 3 | 5 | 6 => {
                    if let Some(slot) = KELVIN_CHANNELS.iter().position(|c| *c == channel) {
                        slots[slot] = reading;
                    }
                }
                7 => slots[5] = reading,
                8 => slots[6] = reading,
                other => warn!(channel = other, "Unknown scanner channel"),
            }
            values.extend(slots);
            return Ok(values);
        }

        let thermometer = if self.pt_flange { PT_FLANGE } else { MIXING_CHAMBER };
        let (channel, reading) = self
            .bridge
            .read_scanned(|channel| match channel {
                MIXING_CHAMBER => Some((thermometer, Quantity::Kelvin)),
                7 | 8 => Some((channel, Quantity::Ohms)),
                _ => None,
            })
            .await?;
        let (mut t, mut t7, mut t8) = (None, None, None);
        match channel {
            MIXING_CHAMBER => t = reading,
            7 => t7 = reading,
            8 => t8 = reading,
            _ => {}
        }
        let rk = match &self.resistance_meter {
            Some(meter) => Some(meter.resistance().await?),
            None => None,
        };
        values.extend([t, t7, t8, rk]);
        Ok(values)
    }

    async fn lockin_status(&self, index: usize) -> Result<LockinStatus> {
        self.lockin(index)?.status().await
    }

    async fn lockin_range_up(&self, index: usize) -> Result<Option<u8>> {
        self.lockin(index)?.range_up().await
    }

    async fn prepare_sampling(&self, mode: SamplingMode) -> Result<()> {
        match mode {
            SamplingMode::AutoscanFollow => self.bridge.select_channel(1, true).await,
            SamplingMode::DeltaSweep => self.current_source().map(|_| ()),
            _ => Ok(()),
        }
    }

    async fn set_gate_voltage(&self, volts: f64) -> Result<()> {
        match &self.gate {
            Some(gate) => gate.set_voltage(volts).await.map(|_| ()),
            None => {
                warn!("Gate source not configured");
                Ok(())
            }
        }
    }

    async fn set_gate_current(&self, amps: f64) -> Result<()> {
        match &self.gate {
            Some(gate) => gate.set_current(amps).await.map(|_| ()),
            None => {
                warn!("Gate source not configured");
                Ok(())
            }
        }
    }

    async fn set_gate_output(&self, on: bool) -> Result<()> {
        match &self.gate {
            Some(gate) => gate.set_output(on).await,
            None => {
                warn!("Gate source not configured");
                Ok(())
            }
        }
    }

    async fn set_target_field(&self, tesla: f64, rate_t_per_min: f64) -> Result<()> {
        self.magnet()?.set_target(tesla, rate_t_per_min).await
    }

    async fn magnet_ramping(&self) -> Result<bool> {
        Ok(self.magnet()?.state().await? == MagnetState::Ramping)
    }

    async fn set_target_temperature(&self, kelvin: f64, rate_k_per_min: f64) -> Result<()> {
        self.bridge.set_setpoint(kelvin, Some(rate_k_per_min)).await
    }

    async fn temperature_ramping(&self) -> Result<bool> {
        self.bridge.ramping().await
    }

    async fn set_amplitude(&self, index: usize, volts: f64) -> Result<()> {
        self.lockin(index)?.set_amplitude(volts).await
    }

    async fn set_frequency(&self, index: usize, hertz: f64) -> Result<()> {
        self.lockin(index)?.set_frequency(hertz).await
    }

    async fn set_offset_expand(&self, index: usize, expand: Option<Expand>) -> Result<()> {
        let lockin = self.lockin(index)?;
        match expand {
            Some(expand) => {
                let offset = lockin.enable_offset_expand(expand).await?;
                info!(lockin = %lockin.id(), offset, %expand, "Offset and expand on");
            }
            None => {
                lockin.disable_offset_expand().await?;
                info!(lockin = %lockin.id(), "Offset and expand off");
            }
        }
        Ok(())
    }

    async fn select_tc_channel(&self, channel: u8, autoscan: bool) -> Result<()> {
        self.bridge.select_channel(channel, autoscan).await
    }

    async fn step_tc_excitation(&self, direction: Direction) -> Result<Option<u8>> {
        let (channel, _) = self.bridge.scanner().await?;
        self.bridge.step_excitation(channel, direction).await
    }

    async fn step_tc_range(&self, channel: u8, direction: Direction) -> Result<Option<u8>> {
        self.bridge.step_range(channel, direction).await
    }

    async fn set_heater(&self, microwatts: f64) -> Result<()> {
        self.bridge.set_heater(microwatts).await
    }

    async fn arm_differential_sweep(&self, plan: &DeltaPlan) -> Result<()> {
        self.current_source()?.start_differential_sweep(plan).await
    }

    async fn sweep_status(&self) -> Result<SweepStatus> {
        self.current_source()?.status().await
    }

    async fn fetch_differential_trace(&self) -> Result<DifferentialTrace> {
        self.current_source()?.fetch_trace().await
    }

    async fn abort_sweep(&self) -> Result<()> {
        self.current_source()?.abort().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{simulated, CommandLog, SimulatedModel};

    async fn facility(measure_hall: bool) -> (Bluefors, CommandLog) {
        let broker = Arc::new(InstrumentBroker::new());
        broker
            .attach("r1", Box::new(simulated(SimulatedModel::Sr830)))
            .await;
        broker
            .attach("magnet", Box::new(simulated(SimulatedModel::Ami430)))
            .await;
        let bridge = simulated(SimulatedModel::LakeShore370);
        let log = bridge.log();
        broker.attach("tc", Box::new(bridge)).await;
        let config = BlueforsConfig {
            lockins: vec!["r1".into()],
            magnet: Some("magnet".into()),
            bridge: "tc".into(),
            gate: None,
            resistance_meter: None,
            current_source: None,
            measure_hall,
            pt_flange: false,
            first_lockin_measures_current: false,
        };
        (Bluefors::new(&config, broker), log)
    }

    #[tokio::test]
    async fn test_continuous_reads_parked_channel_only() {
        let (site, _log) = facility(true).await;
        let layout = site.layout(SamplingMode::Continuous);
        let values = site.read_channels(SamplingMode::Continuous).await.unwrap();
        assert_eq!(values.len(), layout.len());

        let at = |name: &str| values[layout.index_of(name).unwrap()];
        assert!(at("U1").is_some());
        assert!(at("U2").is_none());
        assert_eq!(at("H"), Some(0.0));
        assert!(at("Hall").is_some());
        assert_eq!(at("T"), Some(0.0125));
        assert!(at("T7").is_none());
        assert!(at("RK").is_none());
    }

    #[tokio::test]
    async fn test_autoscan_fills_one_slot_per_tick() {
        let (site, log) = facility(false).await;
        site.prepare_sampling(SamplingMode::AutoscanFollow)
            .await
            .unwrap();
        assert_eq!(log.commands(), vec!["SCAN 1,1"]);

        let layout = site.layout(SamplingMode::AutoscanFollow);
        let first = site
            .read_channels(SamplingMode::AutoscanFollow)
            .await
            .unwrap();
        let second = site
            .read_channels(SamplingMode::AutoscanFollow)
            .await
            .unwrap();
        let t1 = layout.index_of("T1").unwrap();
        let t2 = layout.index_of("T2").unwrap();
        assert_eq!(first[t1], Some(48.0));
        assert_eq!(first[t2], None);
        assert_eq!(second[t1], None);
        assert_eq!(second[t2], Some(3.9));
    }

    #[tokio::test]
    async fn test_missing_gate_is_a_warning() {
        let (site, _log) = facility(false).await;
        assert!(site.set_gate_voltage(1.0).await.is_ok());
        assert!(site.arm_differential_sweep(&DeltaPlan {
            start: 0.0,
            stop: 1e-6,
            points: 10,
            delta: 1e-8,
        })
        .await
        .is_err());
    }
}
