//! Student insert: a dipstick with a two-sensor controller, a multimeter on the
//! sample and one lock-in read as a full X, Y, R, theta snapshot.

use super::{ChannelLayout, Facility, SamplingMode};
use crate::config::StudentInsertConfig;
use crate::hardware::broker::InstrumentBroker;
use crate::hardware::keithley::Keithley2000;
use crate::hardware::lakeshore::LakeShore335;
use crate::hardware::sr830::{LockinStatus, Sr830};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Student insert facility.
pub struct StudentInsert {
    multimeter: Keithley2000,
    controller: LakeShore335,
    lockin: Sr830,
}

impl StudentInsert {
    /// Facility using the instruments named in `config`.
    pub fn new(config: &StudentInsertConfig, broker: Arc<InstrumentBroker>) -> Self {
        Self {
            multimeter: Keithley2000::new(Arc::clone(&broker), config.multimeter.clone()),
            controller: LakeShore335::new(Arc::clone(&broker), config.temperature_controller.clone()),
            lockin: Sr830::new(broker, config.lockin.clone()),
        }
    }

    fn only_lockin(&self, index: usize) -> Result<&Sr830> {
        if index != 0 {
            bail!("student_insert: only lock-in R1 is available");
        }
        Ok(&self.lockin)
    }
}

#[async_trait]
impl Facility for StudentInsert {
    fn name(&self) -> &'static str {
        "student_insert"
    }

    fn layout(&self, _mode: SamplingMode) -> ChannelLayout {
        let mut layout = ChannelLayout::new();
        layout
            .push("R_Sample", "Ohm")
            .push("T_Sample_1", "K")
            .push("T_Sample_2", "K")
            .push("Ux", "V")
            .push("Uy", "V")
            .push("Ur", "V")
            .push("Theta", "deg");
        layout
    }

    fn lockin_count(&self) -> usize {
        1
    }

    async fn read_channels(&self, _mode: SamplingMode) -> Result<Vec<Option<f64>>> {
        let resistance = self.multimeter.reading().await?;
        let t1 = self.controller.kelvin('A').await?;
        let t2 = self.controller.kelvin('B').await?;
        let [x, y, r, theta] = self.lockin.xy_r_theta().await?;
        Ok([resistance, t1, t2, x, y, r, theta]
            .into_iter()
            .map(Some)
            .collect())
    }

    async fn lockin_status(&self, index: usize) -> Result<LockinStatus> {
        self.only_lockin(index)?.status().await
    }

    async fn lockin_range_up(&self, index: usize) -> Result<Option<u8>> {
        self.only_lockin(index)?.range_up().await
    }

    async fn set_amplitude(&self, index: usize, volts: f64) -> Result<()> {
        self.only_lockin(index)?.set_amplitude(volts).await
    }

    async fn set_frequency(&self, index: usize, hertz: f64) -> Result<()> {
        self.only_lockin(index)?.set_frequency(hertz).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{simulated, SimulatedModel};

    #[tokio::test]
    async fn test_reads_all_seven_channels() {
        let broker = Arc::new(InstrumentBroker::new());
        broker
            .attach("dmm", Box::new(simulated(SimulatedModel::Keithley2000)))
            .await;
        broker
            .attach("ls335", Box::new(simulated(SimulatedModel::LakeShore335)))
            .await;
        broker
            .attach("lockin", Box::new(simulated(SimulatedModel::Sr830)))
            .await;
        let site = StudentInsert::new(
            &StudentInsertConfig {
                multimeter: "dmm".into(),
                temperature_controller: "ls335".into(),
                lockin: "lockin".into(),
            },
            broker,
        );

        let values = site.read_channels(SamplingMode::Continuous).await.unwrap();
        assert_eq!(values.len(), site.layout(SamplingMode::Continuous).len());
        assert_eq!(values[0], Some(1234.56));
        assert_eq!(values[1], Some(4.215));
        assert_eq!(values[6], Some(1.25));
        assert!(site.lockin_status(1).await.is_err());
        assert!(site.set_target_field(1.0, 0.1).await.is_err());
    }
}
