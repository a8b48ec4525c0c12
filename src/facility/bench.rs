//! In-memory facility for tests and script rehearsals.
//!
//! Produces two channels, `U1` (the read counter) and `T` (always missing),
//! records every device action as a short text line and lets callers script
//! lock-in status bytes, failing reads and magnet ramps.

use super::{ChannelLayout, DeltaPlan, Facility, SamplingMode};
use crate::hardware::keithley::{DifferentialTrace, SweepStatus};
use crate::hardware::sr830::{Expand, LockinStatus};
use crate::hardware::Direction;
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Scriptable facility without instruments.
#[derive(Default)]
pub struct BenchFacility {
    reads: AtomicU64,
    failing_reads: Mutex<HashSet<u64>>,
    statuses: Mutex<VecDeque<LockinStatus>>,
    ramp_polls: AtomicU32,
    range: AtomicU8,
    actions: Mutex<Vec<String>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

impl BenchFacility {
    /// Facility with no scripted behaviour.
    pub fn new() -> Self {
        Self::default()
    }

    /// Status bytes returned by the next lock-in status checks, then clean.
    pub fn queue_statuses(&self, statuses: impl IntoIterator<Item = u8>) {
        guard(&self.statuses).extend(statuses.into_iter().map(LockinStatus));
    }

    /// Make read number `n` (0-based) fail.
    pub fn fail_read(&self, n: u64) {
        guard(&self.failing_reads).insert(n);
    }

    /// Report the magnet as ramping for the next `polls` queries.
    pub fn ramp_for(&self, polls: u32) {
        self.ramp_polls.store(polls, Ordering::SeqCst);
    }

    /// Channel reads attempted so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Every device action so far, oldest first.
    pub fn actions(&self) -> Vec<String> {
        guard(&self.actions).clone()
    }

    /// Number of recorded actions starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        guard(&self.actions)
            .iter()
            .filter(|a| a.starts_with(prefix))
            .count()
    }

    fn record(&self, action: String) {
        guard(&self.actions).push(action);
    }
}

#[async_trait]
impl Facility for BenchFacility {
    fn name(&self) -> &'static str {
        "bench"
    }

    fn layout(&self, _mode: SamplingMode) -> ChannelLayout {
        let mut layout = ChannelLayout::new();
        layout.push("U1", "V").push("T", "K");
        layout
    }

    fn lockin_count(&self) -> usize {
        1
    }

    async fn read_channels(&self, _mode: SamplingMode) -> Result<Vec<Option<f64>>> {
        let n = self.reads.fetch_add(1, Ordering::SeqCst);
        if guard(&self.failing_reads).contains(&n) {
            bail!("bench: read {} failed", n);
        }
        Ok(vec![Some(n as f64), None])
    }

    async fn lockin_status(&self, _index: usize) -> Result<LockinStatus> {
        Ok(guard(&self.statuses).pop_front().unwrap_or_default())
    }

    async fn lockin_range_up(&self, index: usize) -> Result<Option<u8>> {
        self.record(format!("range_up {}", index));
        Ok(Some(self.range.fetch_add(1, Ordering::SeqCst) + 1))
    }

    async fn prepare_sampling(&self, mode: SamplingMode) -> Result<()> {
        self.record(format!("prepare {}", mode));
        Ok(())
    }

    async fn set_gate_voltage(&self, volts: f64) -> Result<()> {
        self.record(format!("gate_voltage {}", volts));
        Ok(())
    }

    async fn set_gate_output(&self, on: bool) -> Result<()> {
        self.record(format!("gate_output {}", on));
        Ok(())
    }

    async fn set_target_field(&self, tesla: f64, rate_t_per_min: f64) -> Result<()> {
        self.record(format!("field {} {}", tesla, rate_t_per_min));
        Ok(())
    }

    async fn magnet_ramping(&self) -> Result<bool> {
        let ramping = self
            .ramp_polls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Ok(ramping)
    }

    async fn set_amplitude(&self, index: usize, volts: f64) -> Result<()> {
        self.record(format!("amplitude {} {}", index, volts));
        Ok(())
    }

    async fn set_frequency(&self, index: usize, hertz: f64) -> Result<()> {
        self.record(format!("frequency {} {}", index, hertz));
        Ok(())
    }

    async fn set_offset_expand(&self, index: usize, expand: Option<Expand>) -> Result<()> {
        self.record(format!("offset_expand {} {:?}", index, expand));
        Ok(())
    }

    async fn step_tc_range(&self, channel: u8, direction: Direction) -> Result<Option<u8>> {
        self.record(format!("range {} {}", channel, direction));
        Ok(None)
    }

    async fn set_heater(&self, microwatts: f64) -> Result<()> {
        self.record(format!("heater {}", microwatts));
        Ok(())
    }

    async fn arm_differential_sweep(&self, plan: &DeltaPlan) -> Result<()> {
        self.record(format!("arm {} {} {}", plan.start, plan.stop, plan.points));
        Ok(())
    }

    async fn sweep_status(&self) -> Result<SweepStatus> {
        Ok(SweepStatus(0b10))
    }

    async fn fetch_differential_trace(&self) -> Result<DifferentialTrace> {
        Ok(DifferentialTrace {
            zero_voltage: 1e-6,
            points: vec![(100.0, 0.1), (101.0, 0.2), (102.0, 0.3)],
        })
    }

    async fn abort_sweep(&self) -> Result<()> {
        self.record("abort".to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_behaviour() {
        let bench = BenchFacility::new();
        bench.fail_read(1);
        bench.ramp_for(2);
        assert!(bench.read_channels(SamplingMode::Continuous).await.is_ok());
        assert!(bench.read_channels(SamplingMode::Continuous).await.is_err());
        assert!(bench.magnet_ramping().await.unwrap());
        assert!(bench.magnet_ramping().await.unwrap());
        assert!(!bench.magnet_ramping().await.unwrap());
        assert!(bench.set_target_temperature(1.0, 0.1).await.is_err());
        assert_eq!(bench.reads(), 2);
    }
}
