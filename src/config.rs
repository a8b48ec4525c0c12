//! Rig configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. `config/rig.toml` (or an explicit path)
//! 2. Environment variables prefixed with `RIG_DAQ_`, nested keys separated by `__`
//!    (e.g. `RIG_DAQ_APPLICATION__LOG_LEVEL=debug`)
//!
//! The file names the facility (which site the rig runs at and which instruments it
//! uses) and the transport for every instrument on the bus.
//!
//! # Example
//! ```no_run
//! use rig_daq::config::RigConfig;
//!
//! let config = RigConfig::load()?;
//! config.validate()?;
//! println!("Sample: {}", config.session.sample);
//! # Ok::<(), rig_daq::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use crate::hardware::mock::SimulatedModel;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/rig.toml";

/// Top-level rig configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RigConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Sample name and data directory
    #[serde(default)]
    pub session: SessionConfig,
    /// Acquisition engine tuning
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Interpreter tuning
    #[serde(default)]
    pub interpreter: InterpreterConfig,
    /// Which facility the rig runs at
    pub facility: FacilityConfig,
    /// Instrument definitions
    #[serde(default)]
    pub instruments: Vec<InstrumentDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Per-session metadata used in data file names
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sample name, embedded in every data file name
    pub sample: String,
    /// Root directory for data files; a dated subdirectory is created per day
    pub data_dir: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample: "sample".to_string(),
            data_dir: PathBuf::from("data"),
        }
    }
}

/// Acquisition engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Pause between ticks in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Query lock-in status every N attempted ticks
    #[serde(default = "default_status_check_every")]
    pub status_check_every: u64,
    /// Consecutive output-overload checks before acting
    #[serde(default = "default_overload_threshold")]
    pub overload_threshold: u32,
    /// Bound on waiting for the engine task to exit after stop
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    /// Field ramp rate (T/min) used when a stepped sweep steps the field
    #[serde(default = "default_field_step_rate")]
    pub field_step_rate: f64,
    /// Autorange setting used when a script does not set one
    #[serde(default = "default_enabled")]
    pub autorange: bool,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            status_check_every: default_status_check_every(),
            overload_threshold: default_overload_threshold(),
            stop_timeout_secs: default_stop_timeout_secs(),
            field_step_rate: default_field_step_rate(),
            autorange: true,
        }
    }
}

impl AcquisitionConfig {
    /// Tick pause as a `Duration`
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Engine stop bound as a `Duration`
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

/// Interpreter tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterpreterConfig {
    /// How often blocking waits check for cancellation, in seconds
    #[serde(default = "default_wait_poll_secs")]
    pub wait_poll_secs: u64,
    /// Bound on waiting for the program task to exit after stop
    #[serde(default = "default_program_stop_timeout_secs")]
    pub program_stop_timeout_secs: u64,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            wait_poll_secs: default_wait_poll_secs(),
            program_stop_timeout_secs: default_program_stop_timeout_secs(),
        }
    }
}

impl InterpreterConfig {
    /// Wait poll interval as a `Duration`
    pub fn wait_poll(&self) -> Duration {
        Duration::from_secs(self.wait_poll_secs)
    }

    /// Program stop bound as a `Duration`
    pub fn program_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.program_stop_timeout_secs)
    }
}

/// Facility selection; each variant names the instrument ids it uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FacilityConfig {
    /// Dilution refrigerator with AMI magnet and LakeShore 370 bridge
    Bluefors(BlueforsConfig),
    /// Cryogen-free measurement system driven through the MSS socket
    Cfms(CfmsConfig),
    /// Student insert with LakeShore 335 and Keithley 2000
    StudentInsert(StudentInsertConfig),
}

/// Bluefors instrument assignment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlueforsConfig {
    /// Lock-in ids in R1..R4 order
    #[serde(default)]
    pub lockins: Vec<String>,
    /// Magnet power supply
    #[serde(default)]
    pub magnet: Option<String>,
    /// Resistance bridge with scanner
    pub bridge: String,
    /// Gate voltage/current source
    #[serde(default)]
    pub gate: Option<String>,
    /// Source-measure unit read as the RK channel
    #[serde(default)]
    pub resistance_meter: Option<String>,
    /// Current source used for differential conductance sweeps
    #[serde(default)]
    pub current_source: Option<String>,
    /// Read the Hall sensor on bridge channel 8
    #[serde(default)]
    pub measure_hall: bool,
    /// Read the mixing chamber thermometer from the PT flange channel
    #[serde(default)]
    pub pt_flange: bool,
    /// Label the first lock-in channel as a current
    #[serde(default)]
    pub first_lockin_measures_current: bool,
}

/// CFMS instrument assignment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CfmsConfig {
    /// Lock-in ids in R1..R4 order
    #[serde(default)]
    pub lockins: Vec<String>,
    /// MSS control socket
    pub mss: String,
    /// Gate voltage/current source
    #[serde(default)]
    pub gate: Option<String>,
}

/// Student insert instrument assignment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentInsertConfig {
    /// Multimeter reading the sample resistance
    pub multimeter: String,
    /// Two-input temperature controller
    pub temperature_controller: String,
    /// Lock-in read as X, Y, R, theta
    pub lockin: String,
}

impl FacilityConfig {
    /// All instrument ids the facility talks to
    pub fn referenced_instruments(&self) -> Vec<&str> {
        match self {
            FacilityConfig::Bluefors(c) => {
                let mut ids: Vec<&str> = c.lockins.iter().map(String::as_str).collect();
                ids.push(&c.bridge);
                ids.extend(
                    [&c.magnet, &c.gate, &c.resistance_meter, &c.current_source]
                        .into_iter()
                        .flatten()
                        .map(String::as_str),
                );
                ids
            }
            FacilityConfig::Cfms(c) => {
                let mut ids: Vec<&str> = c.lockins.iter().map(String::as_str).collect();
                ids.push(&c.mss);
                ids.extend(c.gate.as_deref());
                ids
            }
            FacilityConfig::StudentInsert(c) => vec![
                c.multimeter.as_str(),
                c.temperature_controller.as_str(),
                c.lockin.as_str(),
            ],
        }
    }

    fn lockin_count(&self) -> usize {
        match self {
            FacilityConfig::Bluefors(c) => c.lockins.len(),
            FacilityConfig::Cfms(c) => c.lockins.len(),
            FacilityConfig::StudentInsert(_) => 1,
        }
    }
}

/// Instrument definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentDefinition {
    /// Unique instrument identifier
    pub id: String,
    /// Whether this instrument is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// How to reach the instrument
    pub transport: TransportConfig,
}

/// Serial parity setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Even parity
    Even,
    /// Odd parity
    Odd,
}

/// Transport used to reach one instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// RS-232 line protocol
    Serial {
        /// Device path, e.g. `/dev/ttyUSB0`
        port: String,
        /// Baud rate
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        /// Parity
        #[serde(default)]
        parity: Parity,
        /// Line terminator appended to commands and expected on replies
        #[serde(default = "default_terminator")]
        terminator: String,
        /// Read timeout in milliseconds
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
    /// Persistent raw TCP socket
    Tcp {
        /// `host:port`
        address: String,
        /// Line terminator
        #[serde(default = "default_tcp_terminator")]
        terminator: String,
        /// Read timeout in milliseconds
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
    /// CFMS control software socket (one connection per request)
    Mss {
        /// `host:port`
        address: String,
        /// Reply timeout in milliseconds
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
    /// VISA resource (GPIB, USB-TMC, LXI)
    Visa {
        /// VISA resource string, e.g. `GPIB0::12::INSTR`
        resource: String,
        /// Line terminator
        #[serde(default = "default_terminator")]
        terminator: String,
        /// Timeout in milliseconds
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
    /// In-process instrument model
    Simulated {
        /// Which instrument to simulate
        model: SimulatedModel,
    },
}

// Default value functions
fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_status_check_every() -> u64 {
    100
}

fn default_overload_threshold() -> u32 {
    3
}

fn default_stop_timeout_secs() -> u64 {
    10
}

fn default_field_step_rate() -> f64 {
    0.01
}

fn default_wait_poll_secs() -> u64 {
    5
}

fn default_program_stop_timeout_secs() -> u64 {
    5
}

fn default_enabled() -> bool {
    true
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_terminator() -> String {
    "\n".to_string()
}

fn default_tcp_terminator() -> String {
    "\r\n".to_string()
}

fn default_timeout_ms() -> u64 {
    2000
}

impl RigConfig {
    /// Load configuration from `config/rig.toml` and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RIG_DAQ_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.session.sample.trim().is_empty() {
            return Err(DaqError::Configuration("Sample name must not be empty".into()));
        }

        if self.acquisition.status_check_every == 0 {
            return Err(DaqError::Configuration(
                "status_check_every must be at least 1".into(),
            ));
        }
        if self.acquisition.overload_threshold == 0 {
            return Err(DaqError::Configuration(
                "overload_threshold must be at least 1".into(),
            ));
        }
        if !(self.acquisition.field_step_rate > 0.0) {
            return Err(DaqError::Configuration(format!(
                "field_step_rate must be positive, got {}",
                self.acquisition.field_step_rate
            )));
        }
        if self.interpreter.wait_poll_secs == 0 {
            return Err(DaqError::Configuration("wait_poll_secs must be at least 1".into()));
        }

        if self.facility.lockin_count() > 4 {
            return Err(DaqError::Configuration(format!(
                "At most 4 lock-ins are supported, got {}",
                self.facility.lockin_count()
            )));
        }

        // Validate instrument IDs are unique
        let mut ids = HashSet::new();
        for instrument in &self.instruments {
            if !ids.insert(instrument.id.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate instrument ID: {}",
                    instrument.id
                )));
            }
        }

        let enabled: HashSet<&str> = self
            .enabled_instruments()
            .into_iter()
            .map(|inst| inst.id.as_str())
            .collect();
        for id in self.facility.referenced_instruments() {
            if !enabled.contains(id) {
                return Err(DaqError::Configuration(format!(
                    "Facility uses instrument '{}' which is not defined or not enabled",
                    id
                )));
            }
        }

        Ok(())
    }

    /// Get all enabled instruments
    pub fn enabled_instruments(&self) -> Vec<&InstrumentDefinition> {
        self.instruments
            .iter()
            .filter(|inst| inst.enabled)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simulated(id: &str, model: SimulatedModel) -> InstrumentDefinition {
        InstrumentDefinition {
            id: id.to_string(),
            enabled: true,
            transport: TransportConfig::Simulated { model },
        }
    }

    fn student_config() -> RigConfig {
        RigConfig {
            application: ApplicationConfig {
                name: "Test".to_string(),
                log_level: "info".to_string(),
                log_format: "pretty".to_string(),
            },
            session: SessionConfig::default(),
            acquisition: AcquisitionConfig::default(),
            interpreter: InterpreterConfig::default(),
            facility: FacilityConfig::StudentInsert(StudentInsertConfig {
                multimeter: "dmm".into(),
                temperature_controller: "tc".into(),
                lockin: "r1".into(),
            }),
            instruments: vec![
                simulated("dmm", SimulatedModel::Keithley2000),
                simulated("tc", SimulatedModel::LakeShore335),
                simulated("r1", SimulatedModel::Sr830),
            ],
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(student_config().validate().is_ok());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = student_config();
        config.application.log_level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_instrument_ids() {
        let mut config = student_config();
        config
            .instruments
            .push(simulated("dmm", SimulatedModel::Keithley2000));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate instrument ID"));
    }

    #[test]
    fn test_facility_references_disabled_instrument() {
        let mut config = student_config();
        config.instruments[1].enabled = false;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("'tc'"));
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rig.toml");
        std::fs::write(
            &path,
            r#"
[application]
name = "Fridge"
log_level = "debug"

[session]
sample = "S42"
data_dir = "out"

[acquisition]
status_check_every = 50

[facility]
kind = "bluefors"
lockins = ["r1"]
bridge = "tc"
magnet = "magnet"

[[instruments]]
id = "r1"
transport = { kind = "serial", port = "/dev/ttyUSB0", baud_rate = 19200, parity = "even", terminator = "\r" }

[[instruments]]
id = "tc"
transport = { kind = "simulated", model = "lakeshore370" }

[[instruments]]
id = "magnet"
transport = { kind = "tcp", address = "192.168.0.2:7180" }
"#,
        )
        .unwrap();

        let config = RigConfig::load_from(&path).unwrap();
        assert_eq!(config.session.sample, "S42");
        assert_eq!(config.acquisition.status_check_every, 50);
        assert_eq!(config.acquisition.overload_threshold, 3);
        assert_eq!(config.interpreter.wait_poll_secs, 5);
        match &config.facility {
            FacilityConfig::Bluefors(b) => {
                assert_eq!(b.lockins, vec!["r1".to_string()]);
                assert!(b.gate.is_none());
            }
            other => panic!("unexpected facility: {:?}", other),
        }
        match &config.instruments[0].transport {
            TransportConfig::Serial {
                baud_rate,
                parity,
                terminator,
                ..
            } => {
                assert_eq!(*baud_rate, 19200);
                assert_eq!(*parity, Parity::Even);
                assert_eq!(terminator, "\r");
            }
            other => panic!("unexpected transport: {:?}", other),
        }
        assert!(config.validate().is_ok());
    }
}
