//! Cryogen-free measurement system.
//!
//! Field and temperature are owned by the vendor's MSS control program; the rig
//! only sends setpoints and reads back values and stability flags.

use super::{push_lockin_columns, read_lockin_slots, ChannelLayout, Facility, SamplingMode};
use crate::config::CfmsConfig;
use crate::hardware::broker::InstrumentBroker;
use crate::hardware::mss::MssClient;
use crate::hardware::sr830::{Expand, LockinStatus, Sr830};
use crate::hardware::yokogawa::Yokogawa;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// CFMS facility.
pub struct Cfms {
    lockins: Vec<Sr830>,
    mss: MssClient,
    gate: Option<Yokogawa>,
}

impl Cfms {
    /// Facility using the instruments named in `config`.
    pub fn new(config: &CfmsConfig, broker: Arc<InstrumentBroker>) -> Self {
        Self {
            lockins: config
                .lockins
                .iter()
                .map(|id| Sr830::new(Arc::clone(&broker), id.clone()))
                .collect(),
            mss: MssClient::new(Arc::clone(&broker), config.mss.clone()),
            gate: config
                .gate
                .as_ref()
                .map(|id| Yokogawa::new(Arc::clone(&broker), id.clone())),
        }
    }

    fn lockin(&self, index: usize) -> Result<&Sr830> {
        self.lockins
            .get(index)
            .ok_or_else(|| anyhow!("cfms: lock-in R{} is not configured", index + 1))
    }

    fn gate(&self) -> Option<&Yokogawa> {
        if self.gate.is_none() {
            warn!("Gate source not configured");
        }
        self.gate.as_ref()
    }
}

#[async_trait]
impl Facility for Cfms {
    fn name(&self) -> &'static str {
        "cfms"
    }

    fn layout(&self, _mode: SamplingMode) -> ChannelLayout {
        let mut layout = ChannelLayout::new();
        push_lockin_columns(&mut layout, false);
        layout.push("H", "T").push("T", "K");
        layout
    }

    fn lockin_count(&self) -> usize {
        self.lockins.len()
    }

    async fn read_channels(&self, _mode: SamplingMode) -> Result<Vec<Option<f64>>> {
        let mut values = Vec::with_capacity(10);
        read_lockin_slots(&self.lockins, &mut values).await?;
        values.push(Some(self.mss.field().await?));
        values.push(Some(self.mss.temperature().await?));
        Ok(values)
    }

    async fn lockin_status(&self, index: usize) -> Result<LockinStatus> {
        self.lockin(index)?.status().await
    }

    async fn lockin_range_up(&self, index: usize) -> Result<Option<u8>> {
        self.lockin(index)?.range_up().await
    }

    async fn set_gate_voltage(&self, volts: f64) -> Result<()> {
        match self.gate() {
            Some(gate) => gate.set_voltage(volts).await.map(|_| ()),
            None => Ok(()),
        }
    }

    async fn set_gate_current(&self, amps: f64) -> Result<()> {
        match self.gate() {
            Some(gate) => gate.set_current(amps).await.map(|_| ()),
            None => Ok(()),
        }
    }

    async fn set_gate_output(&self, on: bool) -> Result<()> {
        match self.gate() {
            Some(gate) => gate.set_output(on).await,
            None => Ok(()),
        }
    }

    async fn set_target_field(&self, tesla: f64, rate_t_per_min: f64) -> Result<()> {
        self.mss.set_field(tesla, rate_t_per_min).await
    }

    async fn magnet_ramping(&self) -> Result<bool> {
        Ok(!self.mss.field_stable().await?)
    }

    async fn set_target_temperature(&self, kelvin: f64, rate_k_per_min: f64) -> Result<()> {
        self.mss.set_temperature(kelvin, rate_k_per_min).await
    }

    async fn temperature_ramping(&self) -> Result<bool> {
        Ok(!self.mss.temperature_stable().await?)
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
            None => lockin.disable_offset_expand().await?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{simulated, SimulatedModel};

    #[tokio::test]
    async fn test_field_and_temperature_through_mss() {
        let broker = Arc::new(InstrumentBroker::new());
        broker
            .attach("r1", Box::new(simulated(SimulatedModel::Sr830)))
            .await;
        broker
            .attach("mss", Box::new(simulated(SimulatedModel::Mss)))
            .await;
        let site = Cfms::new(
            &CfmsConfig {
                lockins: vec!["r1".into()],
                mss: "mss".into(),
                gate: None,
            },
            broker,
        );

        site.set_target_field(0.75, 0.1).await.unwrap();
        assert!(!site.magnet_ramping().await.unwrap());

        let layout = site.layout(SamplingMode::Continuous);
        let values = site.read_channels(SamplingMode::Continuous).await.unwrap();
        assert_eq!(values[layout.index_of("H").unwrap()], Some(0.75));
        assert_eq!(values[layout.index_of("T").unwrap()], Some(1.8));
        assert!(site
            .prepare_sampling(SamplingMode::AutoscanFollow)
            .await
            .is_err());
        assert!(site.set_heater(10.0).await.is_err());
    }
}
