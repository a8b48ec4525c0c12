//! Experiment session.
//!
//! A [`Session`] owns everything one rig needs at runtime: the facility (and
//! through it the instrument broker), the single acquisition engine slot and the
//! background program task. It replaces ad-hoc global state with one object the
//! CLI (or any other front end) drives through `check`, `start`, `stop` and
//! `wait_program`.
//!
//! ```text
//!  check(text) ──dry run──> estimate logged
//!  start(text) ──dry run──> spawn live run ──> program task
//!  stop()      ──cancel program (bounded)──> stop engine (bounded)
//! ```

use crate::acquisition::EngineSettings;
use crate::config::{InterpreterConfig, RigConfig};
use crate::error::{AppResult, DaqError};
use crate::facility::{self, Facility};
use crate::hardware::InstrumentBroker;
use crate::interpreter::{EngineSlot, Interpreter, ProgramState, RunMode, Script};
use crate::monitor::Monitor;
use chrono::Local;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

type ProgramTask = JoinHandle<AppResult<f64>>;

/// Runtime state of one rig.
pub struct Session {
    facility: Arc<dyn Facility>,
    settings: EngineSettings,
    interpreter: InterpreterConfig,
    engine_stop_timeout: Duration,
    engine: EngineSlot,
    state: Arc<watch::Sender<ProgramState>>,
    program: tokio::sync::Mutex<Option<ProgramTask>>,
    program_cancel: Mutex<CancellationToken>,
}

impl Session {
    /// Attach every configured instrument and build the facility.
    pub async fn open(config: &RigConfig) -> AppResult<Self> {
        let broker = Arc::new(InstrumentBroker::from_config(config).await?);
        let facility = facility::build(&config.facility, broker);
        info!(facility = facility.name(), sample = %config.session.sample, "Session opened");
        Ok(Self::new(
            facility,
            EngineSettings::from_config(config),
            config.interpreter.clone(),
            config.acquisition.stop_timeout(),
        ))
    }

    /// Session over an already built facility.
    pub fn new(
        facility: Arc<dyn Facility>,
        settings: EngineSettings,
        interpreter: InterpreterConfig,
        engine_stop_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ProgramState::Idle);
        Self {
            facility,
            settings,
            interpreter,
            engine_stop_timeout,
            engine: Arc::new(Mutex::new(None)),
            state: Arc::new(state),
            program: tokio::sync::Mutex::new(None),
            program_cancel: Mutex::new(CancellationToken::new()),
        }
    }

    fn interpreter(&self, cancel: CancellationToken) -> Interpreter {
        Interpreter::new(Arc::clone(&self.facility), self.settings.clone())
            .with_engine_slot(Arc::clone(&self.engine))
            .with_status(Arc::clone(&self.state))
            .with_cancellation(cancel)
            .with_timing(self.interpreter.wait_poll(), self.engine_stop_timeout)
    }

    /// Dry-run `text` and log how long it would take.
    pub async fn check(&self, text: &str) -> AppResult<f64> {
        let script = Script::load(text);
        let seconds = self
            .interpreter(CancellationToken::new())
            .run(&script, RunMode::DryRun)
            .await?;
        info!(
            "Estimated time is {:.2} hours ({:.1} minutes)",
            seconds / 3600.0,
            seconds / 60.0
        );
        let finish = chrono::Duration::try_milliseconds((seconds * 1000.0) as i64)
            .and_then(|estimate| Local::now().checked_add_signed(estimate));
        match finish {
            Some(finish) => info!("Program would finish at {}", finish.format("%H:%M")),
            None => info!("Program would finish at an unknown time"),
        }
        Ok(seconds)
    }

    /// Check `text`, then run it live in the background.
    pub async fn start(&self, text: &str) -> AppResult<()> {
        let Ok(mut program) = self.program.try_lock() else {
            return Err(DaqError::State("Program already running".into()));
        };
        if program.as_ref().is_some_and(|task| !task.is_finished()) {
            return Err(DaqError::State("Program already running".into()));
        }
        self.check(text).await?;

        let cancel = CancellationToken::new();
        *self
            .program_cancel
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = cancel.clone();
        let interpreter = self.interpreter(cancel);
        let script = Script::load(text);
        *program = Some(tokio::spawn(
            async move { interpreter.run(&script, RunMode::Live).await }
                .instrument(info_span!("program")),
        ));
        info!("Program started");
        Ok(())
    }

    /// Wait for the background program; `None` when no program was started.
    pub async fn wait_program(&self) -> AppResult<Option<f64>> {
        let mut program = self.program.lock().await;
        let Some(task) = program.as_mut() else {
            return Ok(None);
        };
        let joined = task.await;
        *program = None;
        match joined {
            Ok(result) => result.map(Some),
            Err(e) => Err(DaqError::State(format!("Program task failed: {}", e))),
        }
    }

    /// Cancel the program, then stop the acquisition; both waits are bounded.
    pub async fn stop(&self) {
        self.program_cancel
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .cancel();

        info!("Stopping program");
        let joined = tokio::time::timeout(self.interpreter.program_stop_timeout(), async {
            let mut program = self.program.lock().await;
            if let Some(task) = program.take() {
                if let Err(e) = task.await {
                    error!(error = %e, "Program task failed");
                }
            }
        })
        .await;
        if joined.is_err() {
            error!("Error stopping program");
        }

        let engine = self.engine.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = engine {
            info!(
                timeout_secs = self.engine_stop_timeout.as_secs_f64(),
                "Waiting for the acquisition to stop"
            );
            handle.stop(self.engine_stop_timeout).await;
        }
        info!("Session stopped");
    }

    /// Facade over the engine slot and program state.
    pub fn monitor(&self) -> Monitor {
        Monitor::new(Arc::clone(&self.engine), self.state.subscribe())
    }

    /// Facility the session drives.
    pub fn facility(&self) -> &Arc<dyn Facility> {
        &self.facility
    }
}
