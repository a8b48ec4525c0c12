//! CFMS measurement system software client.
//!
//! Field and temperature on the CFMS are controlled by the vendor's MSS program,
//! reached through an [`MssTransport`](super::transport::MssTransport) attached to
//! the broker. Readings come back as `value,flag` pairs.

use crate::hardware::broker::InstrumentBroker;
use anyhow::{anyhow, Result};
use std::sync::Arc;

/// MSS client.
#[derive(Clone)]
pub struct MssClient {
    broker: Arc<InstrumentBroker>,
    id: String,
}

impl MssClient {
    /// Client for the MSS socket attached under `id`.
    pub fn new(broker: Arc<InstrumentBroker>, id: impl Into<String>) -> Self {
        Self {
            broker,
            id: id.into(),
        }
    }

    /// Field at the sample platform, in tesla.
    pub async fn field(&self) -> Result<f64> {
        self.first("READ? BA").await
    }

    /// Sample temperature (sensor B), in kelvin.
    pub async fn temperature(&self) -> Result<f64> {
        self.first("READ? TB").await
    }

    /// Ramp the magnet to `tesla` at `rate_t_per_min`.
    pub async fn set_field(&self, tesla: f64, rate_t_per_min: f64) -> Result<()> {
        self.broker
            .write(&self.id, &format!("SET B{},{}", tesla, rate_t_per_min))
            .await
    }

    /// Ramp the sample temperature to `kelvin` at `rate_k_per_min`.
    pub async fn set_temperature(&self, kelvin: f64, rate_k_per_min: f64) -> Result<()> {
        self.broker
            .write(&self.id, &format!("SET T{},{}", kelvin, rate_k_per_min))
            .await
    }

    /// Whether the magnet supply reports a stable field.
    pub async fn field_stable(&self) -> Result<bool> {
        self.stable("STAB? B").await
    }

    /// Whether sensor B reports a stable temperature.
    pub async fn temperature_stable(&self) -> Result<bool> {
        self.stable("STAB? TB").await
    }

    async fn stable(&self, command: &str) -> Result<bool> {
        let reply = self.broker.query(&self.id, command).await?;
        Ok(reply.trim().eq_ignore_ascii_case("TRUE"))
    }

    async fn first(&self, command: &str) -> Result<f64> {
        self.broker
            .query_values(&self.id, command)
            .await?
            .first()
            .copied()
            .ok_or_else(|| anyhow!("{}: empty reply to '{}'", self.id, command))
    }
}
