//! Instruction interpreter.
//!
//! A script is a list of lines, one command per line. The same evaluator runs
//! a script in two modes:
//!
//! - [`RunMode::DryRun`] validates every line and adds up the estimated
//!   duration without touching instruments or sleeping
//! - [`RunMode::Live`] validates each line the same way, then acts: device
//!   actions through the [`Facility`], engine start/stop, real waits
//!
//! A dry run that succeeds therefore guarantees the live run gets past parsing
//! up to the first device action.
//!
//! # Example
//!
//! ```no_run
//! # async fn demo(facility: std::sync::Arc<dyn rig_daq::facility::Facility>,
//! #               settings: rig_daq::acquisition::EngineSettings) -> rig_daq::error::AppResult<()> {
//! use rig_daq::interpreter::{Interpreter, RunMode, Script};
//!
//! let script = Script::load("config step-relax 2\nwait 90 s\n");
//! let seconds = Interpreter::new(facility, settings)
//!     .run(&script, RunMode::DryRun)
//!     .await?;
//! assert_eq!(seconds, 90.0);
//! # Ok(())
//! # }
//! ```

pub mod command;
pub mod state;

pub use command::Command;
pub use state::ProgramState;

use crate::acquisition::{AcquisitionEngine, EngineHandle, EngineSettings, Protocol, StepSweep};
use crate::config::InterpreterConfig;
use crate::error::{AppResult, DaqError};
use crate::facility::Facility;
use command::{ConfigParam, USAGE_SET_TARGET_FIELD, USAGE_SET_TARGET_TEMPERATURE, USAGE_START_STEP};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Slot holding the single active acquisition.
///
/// Never held across an await point.
pub type EngineSlot = Arc<Mutex<Option<EngineHandle>>>;

/// Default bound on stopping an engine from a `stop` line.
pub const ENGINE_STOP_TIMEOUT: Duration = Duration::from_secs(10);

const RULE: &str = "*************************";

/// Script text, split into lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Script {
    lines: Vec<String>,
}

impl Script {
    /// Split `text` into lines; blank lines are kept so line numbers match the file.
    pub fn load(text: &str) -> Self {
        Self {
            lines: text.lines().map(|l| l.trim().to_string()).collect(),
        }
    }

    /// Read a script file.
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(Self::load(&text))
    }

    /// All lines, 0-based.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// True when there is no command at all.
    pub fn is_empty(&self) -> bool {
        self.lines.iter().all(|l| l.is_empty())
    }
}

/// How the evaluator treats each command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Validate and estimate only
    DryRun,
    /// Validate, then act on the rig
    Live,
}

/// Values accumulated by `config` lines during one pass.
#[derive(Debug, Default)]
struct RunConfig {
    step_relax: Option<f64>,
    step_measure: Option<f64>,
    autorange: Option<bool>,
    current_field: Option<f64>,
    current_temperature: Option<f64>,
}

/// Sequential script evaluator.
pub struct Interpreter {
    facility: Arc<dyn Facility>,
    settings: EngineSettings,
    engine: EngineSlot,
    state: Arc<watch::Sender<ProgramState>>,
    cancel: CancellationToken,
    wait_poll: Duration,
    engine_stop_timeout: Duration,
}

impl Interpreter {
    /// Interpreter with its own engine slot, status channel and token.
    pub fn new(facility: Arc<dyn Facility>, settings: EngineSettings) -> Self {
        let (state, _) = watch::channel(ProgramState::Idle);
        Self {
            facility,
            settings,
            engine: Arc::new(Mutex::new(None)),
            state: Arc::new(state),
            cancel: CancellationToken::new(),
            wait_poll: InterpreterConfig::default().wait_poll(),
            engine_stop_timeout: ENGINE_STOP_TIMEOUT,
        }
    }

    /// Share an engine slot with other interpreters and the monitor.
    pub fn with_engine_slot(mut self, engine: EngineSlot) -> Self {
        self.engine = engine;
        self
    }

    /// Publish program state on an existing channel.
    pub fn with_status(mut self, state: Arc<watch::Sender<ProgramState>>) -> Self {
        self.state = state;
        self
    }

    /// Stop cooperatively when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Override the wait poll interval and the engine stop bound.
    pub fn with_timing(mut self, wait_poll: Duration, engine_stop_timeout: Duration) -> Self {
        self.wait_poll = wait_poll;
        self.engine_stop_timeout = engine_stop_timeout;
        self
    }

    /// Engine slot used by this interpreter.
    pub fn engine_slot(&self) -> EngineSlot {
        Arc::clone(&self.engine)
    }

    /// Receiver for program state changes.
    pub fn status(&self) -> watch::Receiver<ProgramState> {
        self.state.subscribe()
    }

    /// Run `script` in `mode`, returning the estimated duration in seconds.
    ///
    /// The first syntax or instrument fault aborts the pass. Cancellation ends
    /// it early with the estimate accumulated so far.
    pub async fn run(&self, script: &Script, mode: RunMode) -> AppResult<f64> {
        let previous = *self.state.borrow();
        if mode == RunMode::DryRun {
            self.state.send_replace(ProgramState::Checking);
        }
        info!("{}", RULE);
        for line in script.lines() {
            info!("{}", line);
        }
        info!("{}", RULE);

        let mut config = RunConfig::default();
        let mut estimate = 0.0;
        for (index, text) in script.lines().iter().enumerate() {
            let line = index + 1;
            let mut tokens = text.split_whitespace();
            let Some(op) = tokens.next() else {
                continue;
            };
            let args: Vec<&str> = tokens.collect();

            if mode == RunMode::Live {
                if self.cancel.is_cancelled() {
                    return Ok(self.interrupted(estimate));
                }
                self.state.send_replace(ProgramState::Running { line });
            }
            info!("{:02}: Processing command {}({})", line, op, args.join(","));

            let outcome = match Command::parse(line, op, &args) {
                Ok(command) => self.execute(line, command, mode, &mut config).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(seconds) => estimate += seconds,
                Err(e) => {
                    error!(line, error = %e, "Program aborted");
                    self.state.send_replace(ProgramState::Failed);
                    return Err(e);
                }
            }
        }

        match mode {
            RunMode::DryRun => {
                self.state.send_replace(previous);
            }
            RunMode::Live => {
                if self.cancel.is_cancelled() {
                    return Ok(self.interrupted(estimate));
                }
                info!("Program complete");
                self.state.send_replace(ProgramState::Complete);
            }
        }
        Ok(estimate)
    }

    fn interrupted(&self, estimate: f64) -> f64 {
        warn!("Program interrupted");
        self.state.send_replace(ProgramState::Interrupted);
        estimate
    }

    async fn execute(
        &self,
        line: usize,
        command: Command,
        mode: RunMode,
        config: &mut RunConfig,
    ) -> AppResult<f64> {
        let live = mode == RunMode::Live;
        let facility = &self.facility;
        match command {
            Command::Config(param) => {
                match param {
                    ConfigParam::StepRelax(v) => config.step_relax = Some(v),
                    ConfigParam::StepMeasure(v) => config.step_measure = Some(v),
                    ConfigParam::CurrentField(v) => config.current_field = Some(v),
                    ConfigParam::CurrentTemperature(v) => config.current_temperature = Some(v),
                    ConfigParam::Autorange(v) => config.autorange = Some(v),
                }
                debug!(?param, "Run configuration updated");
                Ok(0.0)
            }
            Command::StartSimple { name } => {
                if live {
                    self.start_engine(name, Protocol::Continuous, config).await?;
                }
                Ok(0.0)
            }
            Command::StartCooldown { name } => {
                if live {
                    self.start_engine(name, Protocol::AutoscanFollow, config).await?;
                }
                Ok(0.0)
            }
            Command::StartStep {
                name,
                parameter,
                targets,
            } => {
                let relax = config
                    .step_relax
                    .ok_or_else(|| missing(line, "step-relax not configured", USAGE_START_STEP))?;
                let measure = config
                    .step_measure
                    .ok_or_else(|| missing(line, "step-measure not configured", USAGE_START_STEP))?;
                let seconds = targets.len() as f64 * (relax + measure);
                info!(
                    %parameter,
                    steps = targets.len(),
                    minutes = seconds / 60.0,
                    "Stepped sweep estimate"
                );
                if live {
                    let sweep = StepSweep::new(parameter, targets, relax, measure);
                    self.start_engine(name, Protocol::SteppedSweep(sweep), config)
                        .await?;
                }
                Ok(seconds)
            }
            Command::StartDidv { name, plan } => {
                if live {
                    self.start_engine(name, Protocol::DeltaSweep(plan), config)
                        .await?;
                }
                Ok(0.0)
            }
            Command::Stop => {
                if live {
                    let engine = self.lock_engine().take();
                    match engine {
                        Some(handle) => {
                            handle.stop(self.engine_stop_timeout).await;
                        }
                        None => {
                            let fault = DaqError::State("Experiment not started!".into());
                            error!(line, error = %fault, "Cannot stop");
                        }
                    }
                }
                Ok(0.0)
            }
            Command::Wait { seconds } => {
                if live {
                    info!("Waiting for {} seconds", seconds);
                    let total =
                        Duration::try_from_secs_f64(seconds.max(0.0)).unwrap_or(Duration::MAX);
                    self.sleep_cancellable(total).await;
                }
                Ok(seconds)
            }
            Command::WaitForField => {
                if live {
                    info!("Waiting for the field to settle");
                    while facility.magnet_ramping().await.map_err(DaqError::instrument)? {
                        if !self.poll_pause().await {
                            break;
                        }
                    }
                }
                Ok(0.0)
            }
            Command::WaitForTemperature => {
                if live {
                    info!("Waiting for the temperature to settle");
                    while facility
                        .temperature_ramping()
                        .await
                        .map_err(DaqError::instrument)?
                    {
                        if !self.poll_pause().await {
                            break;
                        }
                    }
                }
                Ok(0.0)
            }
            Command::WaitForProgram => {
                if live {
                    info!("Waiting for the acquisition to finish");
                    while self.engine_active() {
                        if !self.poll_pause().await {
                            break;
                        }
                    }
                }
                Ok(0.0)
            }
            Command::SetGateVoltage { volts } => {
                if live {
                    facility
                        .set_gate_voltage(volts)
                        .await
                        .map_err(DaqError::instrument)?;
                }
                Ok(0.0)
            }
            Command::SetGateCurrent { amps } => {
                if live {
                    facility
                        .set_gate_current(amps)
                        .await
                        .map_err(DaqError::instrument)?;
                }
                Ok(0.0)
            }
            Command::SetGateState { on } => {
                if live {
                    facility
                        .set_gate_output(on)
                        .await
                        .map_err(DaqError::instrument)?;
                }
                Ok(0.0)
            }
            Command::SetTargetField { tesla, rate } => {
                let current = config.current_field.ok_or_else(|| {
                    missing(line, "current-field not configured", USAGE_SET_TARGET_FIELD)
                })?;
                let seconds = (tesla - current).abs() / rate * 60.0;
                info!(
                    from = current,
                    to = tesla,
                    rate,
                    delay = %hms(seconds),
                    "Field ramp"
                );
                if live {
                    facility
                        .set_target_field(tesla, rate)
                        .await
                        .map_err(DaqError::instrument)?;
                }
                config.current_field = Some(tesla);
                Ok(seconds)
            }
            Command::SetTargetTemperature { kelvin, rate } => {
                let current = config.current_temperature.ok_or_else(|| {
                    missing(
                        line,
                        "current-temperature not configured",
                        USAGE_SET_TARGET_TEMPERATURE,
                    )
                })?;
                let seconds = (kelvin - current).abs() / rate * 60.0;
                info!(
                    from = current,
                    to = kelvin,
                    rate,
                    delay = %hms(seconds),
                    "Temperature ramp"
                );
                if live {
                    facility
                        .set_target_temperature(kelvin, rate)
                        .await
                        .map_err(DaqError::instrument)?;
                }
                config.current_temperature = Some(kelvin);
                Ok(seconds)
            }
            Command::SetAmplitude { volts } => {
                if live {
                    facility
                        .set_amplitude(0, volts)
                        .await
                        .map_err(DaqError::instrument)?;
                }
                Ok(0.0)
            }
            Command::SetFrequency { hertz } => {
                if live {
                    facility
                        .set_frequency(0, hertz)
                        .await
                        .map_err(DaqError::instrument)?;
                }
                Ok(0.0)
            }
            Command::SetOffsetExpand { lockin, expand } => {
                if live {
                    facility
                        .set_offset_expand(lockin, expand)
                        .await
                        .map_err(DaqError::instrument)?;
                }
                Ok(0.0)
            }
            Command::TcChannel { channel } => {
                if live {
                    facility
                        .select_tc_channel(channel, false)
                        .await
                        .map_err(DaqError::instrument)?;
                }
                Ok(0.0)
            }
            Command::TcCurrent { direction } => {
                if live {
                    match facility
                        .step_tc_excitation(direction)
                        .await
                        .map_err(DaqError::instrument)?
                    {
                        Some(excitation) => info!(%direction, excitation, "Excitation changed"),
                        None => warn!(%direction, "Excitation already at its limit"),
                    }
                }
                Ok(0.0)
            }
            Command::SetRange { channel, direction } => {
                if live {
                    match facility
                        .step_tc_range(channel, direction)
                        .await
                        .map_err(DaqError::instrument)?
                    {
                        Some(range) => info!(channel, %direction, range, "Resistance range changed"),
                        None => warn!(channel, %direction, "Resistance range already at its limit"),
                    }
                }
                Ok(0.0)
            }
        }
    }

    /// Start an acquisition unless one is already running.
    async fn start_engine(&self, name: String, protocol: Protocol, config: &RunConfig) -> AppResult<()> {
        if self.engine_active() {
            let fault = DaqError::State(format!(
                "Experiment already running, '{}' not started",
                name
            ));
            error!(error = %fault, "Start skipped");
            return Ok(());
        }
        let settings = self
            .settings
            .clone()
            .with_autorange(config.autorange.unwrap_or(self.settings.autorange));
        let handle = AcquisitionEngine::new(Arc::clone(&self.facility), settings, name, protocol)
            .start()
            .await?;
        info!(
            engine = %handle.id(),
            file = %handle.paths().raw.display(),
            "Experiment started"
        );
        *self.lock_engine() = Some(handle);
        Ok(())
    }

    /// True while an unfinished engine sits in the slot; a finished one is reaped.
    fn engine_active(&self) -> bool {
        let mut slot = self.lock_engine();
        match slot.as_ref() {
            Some(handle) if handle.is_finished() => {
                info!(engine = %handle.id(), name = %handle.name(), "Acquisition finished");
                *slot = None;
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    fn lock_engine(&self) -> MutexGuard<'_, Option<EngineHandle>> {
        self.engine.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sleep `total`, waking every poll interval to check for cancellation.
    /// A `total` past the clock's range sleeps until cancelled.
    async fn sleep_cancellable(&self, total: Duration) {
        let deadline = Instant::now().checked_add(total);
        loop {
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => self.wait_poll,
            };
            if remaining.is_zero() || self.cancel.is_cancelled() {
                return;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = sleep(remaining.min(self.wait_poll)) => {}
            }
        }
    }

    /// One poll interval; `false` when cancelled.
    async fn poll_pause(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = sleep(self.wait_poll) => true,
        }
    }
}

fn missing(line: usize, reason: &str, usage: &'static str) -> DaqError {
    DaqError::Syntax {
        line,
        reason: reason.to_string(),
        usage,
    }
}

/// `HH:MM:SS` rendering of a duration in seconds.
pub fn hms(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    format!("{:02}:{:02}:{:02}", total / 3600, total / 60 % 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hms() {
        assert_eq!(hms(0.0), "00:00:00");
        assert_eq!(hms(3725.4), "01:02:05");
    }

    #[cfg(feature = "storage_csv")]
    mod live {
        use super::super::*;
        use crate::facility::bench::BenchFacility;
        use tracing_test::traced_test;

        fn interpreter(bench: &Arc<BenchFacility>, dir: &Path) -> Interpreter {
            let settings = EngineSettings {
                tick_interval: Duration::from_secs(1),
                status_check_every: 100,
                overload_threshold: 3,
                field_step_rate: 0.01,
                autorange: true,
                data_dir: dir.to_path_buf(),
                sample: "S".into(),
            };
            Interpreter::new(bench.clone(), settings)
                .with_timing(Duration::from_secs(1), Duration::from_secs(2))
        }

        #[tokio::test(start_paused = true)]
        #[traced_test]
        async fn test_second_start_is_skipped() {
            let dir = tempfile::tempdir().unwrap();
            let bench = Arc::new(BenchFacility::new());
            let interpreter = interpreter(&bench, dir.path());
            let script = Script::load("start-simple first\nstart-cooldown second\nwait 3 s\nstop\n");

            let seconds = interpreter.run(&script, RunMode::Live).await.unwrap();
            assert_eq!(seconds, 3.0);
            assert!(logs_contain("Experiment already running"));
            assert_eq!(bench.count("prepare"), 1);
            assert!(interpreter.engine_slot().lock().unwrap().is_none());
            assert_eq!(*interpreter.status().borrow(), ProgramState::Complete);
        }

        #[tokio::test(start_paused = true)]
        #[traced_test]
        async fn test_stop_without_engine_is_logged() {
            let dir = tempfile::tempdir().unwrap();
            let bench = Arc::new(BenchFacility::new());
            let interpreter = interpreter(&bench, dir.path());

            let result = interpreter.run(&Script::load("stop"), RunMode::Live).await;
            assert_eq!(result.unwrap(), 0.0);
            assert!(logs_contain("Experiment not started!"));
        }
    }

    #[test]
    fn test_script_keeps_line_numbers() {
        let script = Script::load("wait 1 s\n\n  stop  \n");
        assert_eq!(script.lines(), ["wait 1 s", "", "stop"]);
        assert!(!script.is_empty());
        assert!(Script::load("\n \n").is_empty());
    }
}
