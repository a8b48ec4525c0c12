//! Acquisition engine.
//!
//! One engine runs one sampling protocol against a [`Facility`] in its own tokio
//! task. [`AcquisitionEngine::start`] does all fallible preparation (files,
//! headers, instrument setup) before spawning, so a failed start leaves nothing
//! running. The returned [`EngineHandle`] is the only way to observe or stop the
//! task.
//!
//! # Tick loop
//!
//! ```text
//! ┌────────────┐   status check every N ticks   ┌──────────────┐
//! │ tick start │ ─────────────────────────────▶ │ read channels│
//! └────────────┘                                └──────┬───────┘
//!       ▲                 error: tick discarded        │ ok
//!       │                                              ▼
//!  sleep(tick_interval) ◀── persist / step bookkeeping ┘
//! ```
//!
//! Cancellation is checked at tick boundaries and while sleeping; a transaction
//! already on the bus always completes.

use super::overload::{OverloadMonitor, OverloadVerdict};
use super::series::{Sample, SampleSeries};
use super::storage::{DataPaths, TsvWriter};
use super::sweep::StepSweep;
use crate::config::RigConfig;
use crate::error::{AppResult, DaqError};
use crate::facility::{lockin_label, ChannelLayout, DeltaPlan, Facility, SamplingMode, StepParameter};
use anyhow::Result;
use chrono::Local;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Poll period of the differential sweep status register.
const SWEEP_POLL: Duration = Duration::from_secs(1);

/// Sampling protocol with its parameters.
#[derive(Debug, Clone)]
pub enum Protocol {
    /// Read every channel each tick
    Continuous,
    /// Follow the thermometry scanner
    AutoscanFollow,
    /// Stepped sweep with averaging
    SteppedSweep(StepSweep),
    /// Hardware differential conductance sweep
    DeltaSweep(DeltaPlan),
}

impl Protocol {
    /// Sampling mode passed to the facility.
    pub fn mode(&self) -> SamplingMode {
        match self {
            Protocol::Continuous => SamplingMode::Continuous,
            Protocol::AutoscanFollow => SamplingMode::AutoscanFollow,
            Protocol::SteppedSweep(_) => SamplingMode::SteppedSweep,
            Protocol::DeltaSweep(_) => SamplingMode::DeltaSweep,
        }
    }
}

/// Engine parameters taken from configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Pause after each tick
    pub tick_interval: Duration,
    /// Lock-in status is checked on every N-th attempted tick
    pub status_check_every: u64,
    /// Consecutive overloads before acting
    pub overload_threshold: u32,
    /// Field ramp rate for field steps, T/min
    pub field_step_rate: f64,
    /// Raise the lock-in range on repeated overload
    pub autorange: bool,
    /// Root of the data tree
    pub data_dir: PathBuf,
    /// Sample name used in file names
    pub sample: String,
}

impl EngineSettings {
    /// Settings from the rig configuration.
    pub fn from_config(config: &RigConfig) -> Self {
        let acquisition = &config.acquisition;
        Self {
            tick_interval: acquisition.tick_interval(),
            status_check_every: acquisition.status_check_every.max(1),
            overload_threshold: acquisition.overload_threshold,
            field_step_rate: acquisition.field_step_rate,
            autorange: acquisition.autorange,
            data_dir: config.session.data_dir.clone(),
            sample: config.session.sample.clone(),
        }
    }

    /// Override the autorange flag.
    pub fn with_autorange(mut self, autorange: bool) -> Self {
        self.autorange = autorange;
        self
    }
}

/// An acquisition ready to start.
pub struct AcquisitionEngine {
    facility: Arc<dyn Facility>,
    settings: EngineSettings,
    name: String,
    protocol: Protocol,
}

impl AcquisitionEngine {
    /// Engine for acquisition `name`.
    pub fn new(
        facility: Arc<dyn Facility>,
        settings: EngineSettings,
        name: impl Into<String>,
        protocol: Protocol,
    ) -> Self {
        Self {
            facility,
            settings,
            name: name.into(),
            protocol,
        }
    }

    /// Create files, prepare instruments and spawn the sampling task.
    pub async fn start(self) -> AppResult<EngineHandle> {
        let id = Uuid::new_v4();
        let mode = self.protocol.mode();
        let paths = DataPaths::new(
            &self.settings.data_dir,
            &self.settings.sample,
            &self.name,
            Local::now(),
        );
        let layout = self.facility.layout(mode);
        let cancel = CancellationToken::new();
        let (latest_tx, latest_rx) = watch::channel(None);

        let span = info_span!("acquisition", engine = %id, name = %self.name);
        info!(engine = %id, name = %self.name, %mode, "Starting acquisition");

        let task = match self.protocol {
            Protocol::DeltaSweep(plan) => {
                let mut trace = TsvWriter::create(&paths.differential)?;
                trace.write_header(["I", "time", "dV/dI"], ["A", "seconds", "Ohm"])?;
                self.facility
                    .prepare_sampling(mode)
                    .await
                    .map_err(DaqError::instrument)?;
                self.facility
                    .arm_differential_sweep(&plan)
                    .await
                    .map_err(DaqError::instrument)?;
                let sweep = DeltaSweepTask {
                    facility: Arc::clone(&self.facility),
                    plan,
                    trace,
                };
                tokio::spawn(sweep.run(cancel.clone()).instrument(span))
            }
            protocol => {
                let mut raw = TsvWriter::create(&paths.raw)?;
                raw.write_header(
                    std::iter::once("time").chain(layout.names()),
                    std::iter::once("seconds").chain(layout.units()),
                )?;
                let step = match protocol {
                    Protocol::SteppedSweep(sweep) => {
                        let mut aggregate = TsvWriter::create(&paths.aggregate)?;
                        write_aggregate_header(&mut aggregate, sweep.parameter(), &layout)?;
                        Some((sweep, aggregate))
                    }
                    _ => None,
                };
                self.facility
                    .prepare_sampling(mode)
                    .await
                    .map_err(DaqError::instrument)?;
                let ticks = TickLoop {
                    overload: OverloadMonitor::new(
                        self.facility.lockin_count(),
                        self.settings.overload_threshold,
                        self.settings.autorange,
                    ),
                    facility: Arc::clone(&self.facility),
                    series: SampleSeries::new(layout.len()),
                    settings: self.settings,
                    mode,
                    raw,
                    step,
                    latest: latest_tx,
                };
                tokio::spawn(ticks.run(cancel.clone()).instrument(span))
            }
        };

        Ok(EngineHandle {
            id,
            name: self.name,
            mode,
            layout,
            paths,
            cancel,
            task,
            latest: latest_rx,
        })
    }
}

fn write_aggregate_header(
    writer: &mut TsvWriter,
    parameter: StepParameter,
    layout: &ChannelLayout,
) -> AppResult<()> {
    let mut names = vec![parameter.name().to_string()];
    let mut units = vec![parameter.unit().to_string()];
    for channel in layout.channels() {
        names.push(channel.name.clone());
        names.push(format!("delta{}", channel.name));
        units.push(channel.unit.clone());
        units.push(channel.unit.clone());
    }
    writer.write_row(&names)?;
    writer.write_row(&units)
}

/// Handle to a running acquisition.
pub struct EngineHandle {
    id: Uuid,
    name: String,
    mode: SamplingMode,
    layout: ChannelLayout,
    paths: DataPaths,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    latest: watch::Receiver<Option<Sample>>,
}

impl EngineHandle {
    /// Unique id of this acquisition.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Acquisition name from the script.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sampling mode.
    pub fn mode(&self) -> SamplingMode {
        self.mode
    }

    /// Channel columns of the samples.
    pub fn layout(&self) -> &ChannelLayout {
        &self.layout
    }

    /// Files written by this acquisition.
    pub fn paths(&self) -> &DataPaths {
        &self.paths
    }

    /// True once the task has returned (finished sweep, or stopped).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Latest committed sample.
    pub fn latest(&self) -> Option<Sample> {
        self.latest.borrow().clone()
    }

    /// Cancel and wait up to `timeout` for the task to exit.
    ///
    /// Returns `false` (after logging) if the task overran the timeout or panicked.
    pub async fn stop(self, timeout: Duration) -> bool {
        self.cancel.cancel();
        match tokio::time::timeout(timeout, self.task).await {
            Ok(Ok(())) => {
                info!(engine = %self.id, name = %self.name, "Acquisition stopped");
                true
            }
            Ok(Err(e)) => {
                error!(engine = %self.id, error = %e, "Acquisition task failed");
                false
            }
            Err(_) => {
                error!(
                    engine = %self.id,
                    timeout_secs = timeout.as_secs_f64(),
                    "Acquisition did not stop in time"
                );
                false
            }
        }
    }
}

enum Flow {
    Continue,
    Finished,
}

struct TickLoop {
    facility: Arc<dyn Facility>,
    settings: EngineSettings,
    mode: SamplingMode,
    overload: OverloadMonitor,
    series: SampleSeries,
    raw: TsvWriter,
    step: Option<(StepSweep, TsvWriter)>,
    latest: watch::Sender<Option<Sample>>,
}

impl TickLoop {
    async fn run(mut self, cancel: CancellationToken) {
        let origin = Instant::now();
        let mut attempted: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let now = origin.elapsed().as_secs_f64();
            let flow = self.tick(attempted, now).await;
            attempted += 1;
            if let Flow::Finished = flow {
                info!(ticks = attempted, "Sweep finished");
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.settings.tick_interval) => {}
            }
        }
        debug!(ticks = attempted, "Tick loop exited");
    }

    async fn tick(&mut self, attempted: u64, now: f64) -> Flow {
        let values = match self.acquire(attempted).await {
            Ok(values) => values,
            Err(e) => {
                error!(error = %format!("{e:#}"), "Cannot obtain point");
                return Flow::Continue;
            }
        };
        let sample = Sample { time: now, values };
        self.series.push(&sample);

        let Some((sweep, _)) = self.step.as_mut() else {
            self.commit(sample);
            return Flow::Continue;
        };
        let outcome = sweep.on_tick(now, &self.series);
        let parameter = sweep.parameter();

        if outcome.persist {
            self.commit(sample);
        } else {
            self.series.pop();
        }
        if let Some((target, channels)) = &outcome.aggregate {
            let row: Vec<Option<f64>> = channels
                .iter()
                .flat_map(|a| [a.mean, a.std_dev])
                .collect();
            if let Some((_, aggregate)) = self.step.as_mut() {
                if let Err(e) = aggregate.write_values(*target, &row) {
                    error!(error = %e, "Cannot write aggregate");
                }
            }
            info!(%parameter, value = *target, "Step closed");
        }
        if let Some(target) = outcome.enter {
            match self.apply_step(parameter, target).await {
                Ok(()) => info!(%parameter, value = target, "Step entered"),
                Err(e) => {
                    error!(%parameter, value = target, error = %format!("{e:#}"), "Cannot set step value");
                    if let Some((sweep, _)) = self.step.as_mut() {
                        sweep.entry_failed();
                    }
                }
            }
        }
        if outcome.finished {
            Flow::Finished
        } else {
            Flow::Continue
        }
    }

    /// Status checks (when due) then one reading of every channel.
    async fn acquire(&mut self, attempted: u64) -> Result<Vec<Option<f64>>> {
        if attempted % self.settings.status_check_every == 0 {
            for index in 0..self.facility.lockin_count() {
                let status = self.facility.lockin_status(index).await?;
                let lockin = lockin_label(index);
                if !status.is_clear() {
                    warn!(%lockin, %status, "Lock-in status");
                }
                match self.overload.record(index, status) {
                    OverloadVerdict::RangeUp => {
                        info!(%lockin, autorange = true, "Output overload on consecutive checks");
                        match self.facility.lockin_range_up(index).await? {
                            Some(range) => info!(%lockin, range, "Sensitivity range increased"),
                            None => warn!(%lockin, "Already at the top sensitivity range"),
                        }
                    }
                    OverloadVerdict::Report => {
                        info!(%lockin, autorange = false, "Output overload on consecutive checks");
                    }
                    OverloadVerdict::Clear | OverloadVerdict::Counting(_) => {}
                }
            }
        }
        self.facility.read_channels(self.mode).await
    }

    fn commit(&mut self, sample: Sample) {
        if let Err(e) = self.raw.write_values(sample.time, &sample.values) {
            error!(error = %e, "Cannot write sample");
        }
        self.latest.send_replace(Some(sample));
    }

    async fn apply_step(&self, parameter: StepParameter, value: f64) -> Result<()> {
        let facility = &self.facility;
        match parameter {
            StepParameter::AmpR1 => facility.set_amplitude(0, value).await,
            StepParameter::AmpAll => {
                for index in 0..facility.lockin_count() {
                    facility.set_amplitude(index, value).await?;
                }
                Ok(())
            }
            StepParameter::Freq => facility.set_frequency(0, value).await,
            StepParameter::Vg => facility.set_gate_voltage(value).await,
            StepParameter::H => {
                facility
                    .set_target_field(value, self.settings.field_step_rate)
                    .await
            }
            StepParameter::Heater => facility.set_heater(value).await,
        }
    }
}

struct DeltaSweepTask {
    facility: Arc<dyn Facility>,
    plan: DeltaPlan,
    trace: TsvWriter,
}

impl DeltaSweepTask {
    async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!("Differential sweep interrupted");
                    break;
                }
                _ = sleep(SWEEP_POLL) => {}
            }
            match self.facility.sweep_status().await {
                Ok(status) if status.sweep_done() => break,
                Ok(status) => debug!(
                    calibrating = status.calibrating(),
                    sweeping = status.sweeping(),
                    "Differential sweep running"
                ),
                Err(e) => error!(error = %format!("{e:#}"), "Cannot read sweep status"),
            }
        }

        if let Err(e) = self.export().await {
            error!(error = %format!("{e:#}"), "Cannot export differential sweep");
        }
        if let Err(e) = self.facility.abort_sweep().await {
            error!(error = %format!("{e:#}"), "Cannot abort differential sweep");
        }
    }

    async fn export(&mut self) -> Result<()> {
        let trace = self.facility.fetch_differential_trace().await?;
        info!(
            zero_voltage = trace.zero_voltage,
            points = trace.points.len(),
            "Differential sweep exported"
        );
        let step = self.plan.step();
        for (index, (ohms, time)) in trace.points.iter().enumerate() {
            let current = self.plan.start + index as f64 * step;
            self.trace
                .write_values(current, &[Some(*time), Some(*ohms)])?;
        }
        Ok(())
    }
}

#[cfg(all(test, feature = "storage_csv"))]
mod tests {
    use super::*;
    use crate::facility::bench::BenchFacility;
    use std::path::Path;
    use tracing_test::traced_test;

    fn settings(dir: &Path, autorange: bool) -> EngineSettings {
        EngineSettings {
            tick_interval: Duration::from_secs(1),
            status_check_every: 1,
            overload_threshold: 3,
            field_step_rate: 0.01,
            autorange,
            data_dir: dir.to_path_buf(),
            sample: "S".into(),
        }
    }

    fn data_rows(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .skip(2)
            .map(str::to_string)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_overload_with_autorange_raises_range_once() {
        let dir = tempfile::tempdir().unwrap();
        let bench = Arc::new(BenchFacility::new());
        bench.queue_statuses([4, 4, 4, 4]);
        let engine = AcquisitionEngine::new(
            bench.clone(),
            settings(dir.path(), true),
            "ovl",
            Protocol::Continuous,
        );
        let handle = engine.start().await.unwrap();
        sleep(Duration::from_millis(4500)).await;
        assert!(handle.stop(Duration::from_secs(1)).await);

        assert_eq!(bench.count("range_up"), 1);
        assert!(logs_contain("Sensitivity range increased"));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_overload_without_autorange_only_reports() {
        let dir = tempfile::tempdir().unwrap();
        let bench = Arc::new(BenchFacility::new());
        bench.queue_statuses([4, 4, 4, 4]);
        let engine = AcquisitionEngine::new(
            bench.clone(),
            settings(dir.path(), false),
            "ovl",
            Protocol::Continuous,
        );
        let handle = engine.start().await.unwrap();
        sleep(Duration::from_millis(4500)).await;
        assert!(handle.stop(Duration::from_secs(1)).await);

        assert_eq!(bench.count("range_up"), 0);
        assert!(logs_contain("Output overload on consecutive checks"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_read_discards_tick() {
        let dir = tempfile::tempdir().unwrap();
        let bench = Arc::new(BenchFacility::new());
        bench.fail_read(1);
        let handle = AcquisitionEngine::new(
            bench.clone(),
            settings(dir.path(), true),
            "gap",
            Protocol::Continuous,
        )
        .start()
        .await
        .unwrap();
        sleep(Duration::from_millis(2500)).await;

        let latest = handle.latest().unwrap();
        assert_eq!(latest.values, vec![Some(2.0), None]);
        let path = handle.paths().raw.clone();
        assert!(handle.stop(Duration::from_secs(1)).await);

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("time\tU1\tT"));
        assert_eq!(lines.next(), Some("seconds\tV\tK"));
        assert_eq!(data_rows(&path), vec!["0\t0\tNone", "2\t2\tNone"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_fills_the_scanned_slot_only() {
        use crate::config::BlueforsConfig;
        use crate::facility::bluefors::Bluefors;
        use crate::hardware::broker::InstrumentBroker;
        use crate::hardware::mock::{simulated, SimulatedModel};

        let broker = Arc::new(InstrumentBroker::new());
        broker
            .attach("r1", Box::new(simulated(SimulatedModel::Sr830)))
            .await;
        broker
            .attach("tc", Box::new(simulated(SimulatedModel::LakeShore370)))
            .await;
        let site = Arc::new(Bluefors::new(
            &BlueforsConfig {
                lockins: vec!["r1".into()],
                magnet: None,
                bridge: "tc".into(),
                gate: None,
                resistance_meter: None,
                current_source: None,
                measure_hall: false,
                pt_flange: false,
                first_lockin_measures_current: false,
            },
            broker,
        ));

        let dir = tempfile::tempdir().unwrap();
        let handle = AcquisitionEngine::new(
            site,
            settings(dir.path(), true),
            "cool",
            Protocol::AutoscanFollow,
        )
        .start()
        .await
        .unwrap();
        sleep(Duration::from_millis(2500)).await;
        let path = handle.paths().raw.clone();
        assert!(handle.stop(Duration::from_secs(1)).await);

        let text = std::fs::read_to_string(&path).unwrap();
        let header: Vec<&str> = text.lines().next().unwrap().split('\t').collect();
        let rows: Vec<Vec<String>> = data_rows(&path)
            .iter()
            .map(|row| row.split('\t').map(str::to_string).collect())
            .collect();
        assert_eq!(rows.len(), 3);

        let scanned = ["T1", "T2", "T3", "T5", "T6", "T7", "T8"];
        for (tick, row) in rows.iter().enumerate() {
            for (slot, name) in scanned.iter().enumerate() {
                let column = header.iter().position(|h| h == name).unwrap();
                assert_eq!(
                    row[column] != "None",
                    slot == tick,
                    "tick {} column {}",
                    tick,
                    name
                );
            }
        }
        let t1 = header.iter().position(|h| *h == "T1").unwrap();
        assert_eq!(rows[0][t1].parse::<f64>().unwrap(), 48.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delta_sweep_exports_trace() {
        let dir = tempfile::tempdir().unwrap();
        let bench = Arc::new(BenchFacility::new());
        let plan = DeltaPlan {
            start: 0.0,
            stop: 3e-6,
            points: 3,
            delta: 1e-7,
        };
        let handle = AcquisitionEngine::new(
            bench.clone(),
            settings(dir.path(), true),
            "iv",
            Protocol::DeltaSweep(plan),
        )
        .start()
        .await
        .unwrap();
        sleep(Duration::from_millis(1500)).await;
        assert!(handle.is_finished());

        let rows = data_rows(&handle.paths().differential);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1], "0.000001\t0.2\t101");
        assert_eq!(bench.count("arm"), 1);
        assert_eq!(bench.count("abort"), 1);
        assert!(!handle.paths().raw.exists());
    }
}
