//! Mock Hardware Implementations
//!
//! Provides simulated instruments for testing and for rehearsing scripts without
//! a cryostat attached.
//!
//! # Available Mocks
//!
//! - `MockTransport` - a transport driven by a closure, recording every command
//! - `simulated(model)` - a `MockTransport` wrapping a small state machine that
//!   answers the command set of one real instrument
//!
//! Simulated instruments react instantly: magnets reach their target on the
//! command that sets it, current sweeps finish as soon as they are triggered.

use crate::hardware::transport::Transport;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Handler = Box<dyn FnMut(&str) -> Result<Option<String>> + Send>;

/// Shared record of every command a `MockTransport` received.
#[derive(Clone, Default)]
pub struct CommandLog {
    commands: Arc<Mutex<Vec<String>>>,
}

impl CommandLog {
    /// Snapshot of all commands so far, oldest first.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of recorded commands starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.commands()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn push(&self, command: &str) {
        if let Ok(mut commands) = self.commands.lock() {
            commands.push(command.to_string());
        }
    }
}

/// Transport answering from a closure.
///
/// The handler returns `Ok(Some(reply))` for queries, `Ok(None)` for commands
/// without a reply, or an error to simulate a bus fault.
///
/// # Example
///
/// ```rust
/// use rig_daq::hardware::mock::MockTransport;
///
/// let transport = MockTransport::new(|cmd| match cmd {
///     "LIAS?" => Ok(Some("4".to_string())),
///     _ => Ok(None),
/// });
/// let log = transport.log();
/// # let _ = log;
/// ```
pub struct MockTransport {
    handler: Handler,
    log: CommandLog,
    latency: Duration,
    name: String,
}

impl MockTransport {
    /// Transport with zero latency.
    pub fn new<F>(handler: F) -> Self
    where
        F: FnMut(&str) -> Result<Option<String>> + Send + 'static,
    {
        Self::with_latency(handler, Duration::ZERO)
    }

    /// Transport that sleeps `latency` per transaction.
    pub fn with_latency<F>(handler: F, latency: Duration) -> Self
    where
        F: FnMut(&str) -> Result<Option<String>> + Send + 'static,
    {
        Self {
            handler: Box::new(handler),
            log: CommandLog::default(),
            latency,
            name: "mock".to_string(),
        }
    }

    /// Handle to the command log, usable after the transport moved into a broker.
    pub fn log(&self) -> CommandLog {
        self.log.clone()
    }

    fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    async fn dispatch(&mut self, command: &str) -> Result<Option<String>> {
        self.log.push(command);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        (self.handler)(command)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write(&mut self, command: &str) -> Result<()> {
        self.dispatch(command).await.map(|_| ())
    }

    async fn query(&mut self, command: &str) -> Result<String> {
        self.dispatch(command)
            .await?
            .ok_or_else(|| anyhow!("{}: no reply to '{}'", self.name, command))
    }

    fn describe(&self) -> String {
        format!("simulated://{}", self.name)
    }
}

/// Instruments that can be simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimulatedModel {
    /// SR830 lock-in amplifier
    #[serde(rename = "sr830")]
    Sr830,
    /// LakeShore 370 resistance bridge with scanner
    #[serde(rename = "lakeshore370")]
    LakeShore370,
    /// LakeShore 335 temperature controller
    #[serde(rename = "lakeshore335")]
    LakeShore335,
    /// AMI 430 magnet power supply
    #[serde(rename = "ami430")]
    Ami430,
    /// Yokogawa DC source
    #[serde(rename = "yokogawa")]
    Yokogawa,
    /// Keithley 2000 multimeter
    #[serde(rename = "keithley2000")]
    Keithley2000,
    /// Keithley 6430 source-measure unit
    #[serde(rename = "keithley6430")]
    Keithley6430,
    /// Keithley 6221 current source
    #[serde(rename = "keithley6221")]
    Keithley6221,
    /// CFMS measurement system software
    #[serde(rename = "mss")]
    Mss,
}

/// Build a transport backed by a simulated instrument.
pub fn simulated(model: SimulatedModel) -> MockTransport {
    let name = match model {
        SimulatedModel::Sr830 => "sr830",
        SimulatedModel::LakeShore370 => "lakeshore370",
        SimulatedModel::LakeShore335 => "lakeshore335",
        SimulatedModel::Ami430 => "ami430",
        SimulatedModel::Yokogawa => "yokogawa",
        SimulatedModel::Keithley2000 => "keithley2000",
        SimulatedModel::Keithley6430 => "keithley6430",
        SimulatedModel::Keithley6221 => "keithley6221",
        SimulatedModel::Mss => "mss",
    };
    let mut device: Box<dyn SimulatedInstrument> = match model {
        SimulatedModel::Sr830 => Box::<SimSr830>::default(),
        SimulatedModel::LakeShore370 => Box::<SimLakeShore370>::default(),
        SimulatedModel::LakeShore335 => Box::new(SimLakeShore335),
        SimulatedModel::Ami430 => Box::<SimAmi430>::default(),
        SimulatedModel::Yokogawa => Box::<SimYokogawa>::default(),
        SimulatedModel::Keithley2000 => Box::new(SimKeithley2000),
        SimulatedModel::Keithley6430 => Box::new(SimKeithley6430),
        SimulatedModel::Keithley6221 => Box::<SimKeithley6221>::default(),
        SimulatedModel::Mss => Box::<SimMss>::default(),
    };
    MockTransport::new(move |cmd| device.handle(cmd)).named(name)
}

trait SimulatedInstrument: Send {
    fn handle(&mut self, command: &str) -> Result<Option<String>>;
}

fn arg<'a>(command: &'a str, prefix: &str) -> Option<&'a str> {
    command.strip_prefix(prefix).map(str::trim)
}

fn number(text: &str) -> Result<f64> {
    text.trim()
        .trim_end_matches(';')
        .parse()
        .map_err(|_| anyhow!("not a number: '{}'", text))
}

fn unknown(model: &str, command: &str) -> Result<Option<String>> {
    Err(anyhow!("{}: unknown command '{}'", model, command))
}

/// SR830: a 1 kOhm sample driven through a 1 MOhm series resistor.
struct SimSr830 {
    sensitivity: u8,
    amplitude: f64,
    frequency: f64,
    offset: f64,
    expand: u8,
}

impl Default for SimSr830 {
    fn default() -> Self {
        Self {
            sensitivity: 20,
            amplitude: 0.004,
            frequency: 13.777,
            offset: 0.0,
            expand: 0,
        }
    }
}

impl SimSr830 {
    fn r(&self) -> f64 {
        self.amplitude * 1e-3
    }
}

impl SimulatedInstrument for SimSr830 {
    fn handle(&mut self, command: &str) -> Result<Option<String>> {
        let theta: f64 = 1.25;
        match command {
            "SNAP? 3,4" => return Ok(Some(format!("{:e},{}", self.r(), theta))),
            "SNAP? 1,2,3,4" => {
                let r = self.r();
                let x = r * theta.to_radians().cos();
                let y = r * theta.to_radians().sin();
                return Ok(Some(format!("{:e},{:e},{:e},{}", x, y, r, theta)));
            }
            "LIAS?" => return Ok(Some("0".into())),
            "SENS?" => return Ok(Some(self.sensitivity.to_string())),
            "SLVL?" => return Ok(Some(self.amplitude.to_string())),
            "FREQ?" => return Ok(Some(self.frequency.to_string())),
            "OEXP? 3" => return Ok(Some(format!("{:.2},{}", self.offset, self.expand))),
            "AOFF 3" => {
                self.offset = 40.0;
                return Ok(None);
            }
            "*CLS" | "*RST" => return Ok(None),
            _ => {}
        }
        if let Some(value) = arg(command, "SENS ") {
            self.sensitivity = number(value)? as u8;
        } else if let Some(value) = arg(command, "SLVL ") {
            self.amplitude = number(value)?;
        } else if let Some(value) = arg(command, "FREQ ") {
            self.frequency = number(value)?;
        } else if let Some(values) = arg(command, "OEXP 3,") {
            let mut fields = values.split(',');
            self.offset = number(fields.next().unwrap_or("0"))?;
            self.expand = number(fields.next().unwrap_or("0"))? as u8;
        } else {
            return unknown("sr830", command);
        }
        Ok(None)
    }
}

/// LakeShore 370 with an eight-channel scanner.
struct SimLakeShore370 {
    channel: u8,
    autoscan: bool,
    ranges: HashMap<u8, (u8, u8)>,
    setpoint: f64,
    heater: f64,
}

impl Default for SimLakeShore370 {
    fn default() -> Self {
        Self {
            channel: 6,
            autoscan: false,
            ranges: HashMap::new(),
            setpoint: 0.0,
            heater: 0.0,
        }
    }
}

const SCANNER_CHANNELS: [u8; 7] = [1, 2, 3, 5, 6, 7, 8];

impl SimLakeShore370 {
    fn kelvin(channel: u8) -> f64 {
        match channel {
            1 => 48.0,
            2 => 3.9,
            3 => 0.85,
            5 => 0.12,
            6 => 0.0125,
            _ => 0.0,
        }
    }

    fn ohms(channel: u8) -> f64 {
        1000.0 + f64::from(channel) * 137.5
    }

    fn advance(&mut self) {
        let next = SCANNER_CHANNELS
            .iter()
            .position(|c| *c == self.channel)
            .map(|i| SCANNER_CHANNELS[(i + 1) % SCANNER_CHANNELS.len()])
            .unwrap_or(SCANNER_CHANNELS[0]);
        self.channel = next;
    }
}

impl SimulatedInstrument for SimLakeShore370 {
    fn handle(&mut self, command: &str) -> Result<Option<String>> {
        if command == "SCAN?" {
            let reply = format!("{:02},{}", self.channel, u8::from(self.autoscan));
            if self.autoscan {
                self.advance();
            }
            return Ok(Some(reply));
        }
        if command == "RAMPST?" {
            return Ok(Some("0".into()));
        }
        if command == "MOUT?" {
            return Ok(Some(format!("{:e}", self.heater)));
        }
        if let Some(ch) = arg(command, "RDGK? ") {
            return Ok(Some(format!("{:e}", Self::kelvin(number(ch)? as u8))));
        }
        if let Some(ch) = arg(command, "RDGR? ") {
            return Ok(Some(format!("{:e}", Self::ohms(number(ch)? as u8))));
        }
        if let Some(ch) = arg(command, "RDGRNG? ") {
            let (exc, rng) = *self.ranges.get(&(number(ch)? as u8)).unwrap_or(&(5, 10));
            return Ok(Some(format!("0,{},{},0,0", exc, rng)));
        }
        if let Some(values) = arg(command, "RDGRNG ") {
            let fields: Vec<f64> = values.split(',').map(number).collect::<Result<_>>()?;
            if fields.len() != 6 {
                return Err(anyhow!("lakeshore370: RDGRNG expects 6 fields"));
            }
            self.ranges
                .insert(fields[0] as u8, (fields[2] as u8, fields[3] as u8));
            return Ok(None);
        }
        if let Some(values) = arg(command, "SCAN ") {
            let mut fields = values.split(',');
            self.channel = number(fields.next().unwrap_or("6"))? as u8;
            self.autoscan = number(fields.next().unwrap_or("0"))? != 0.0;
            return Ok(None);
        }
        if let Some(value) = arg(command, "SETP ") {
            self.setpoint = number(value)?;
            return Ok(None);
        }
        if let Some(value) = arg(command, "MOUT ") {
            self.heater = number(value)?;
            return Ok(None);
        }
        if arg(command, "RAMP ").is_some() {
            return Ok(None);
        }
        unknown("lakeshore370", command)
    }
}

struct SimLakeShore335;

impl SimulatedInstrument for SimLakeShore335 {
    fn handle(&mut self, command: &str) -> Result<Option<String>> {
        match command {
            "KRDG? A" => Ok(Some("+4.2150".into())),
            "KRDG? B" => Ok(Some("+4.1980".into())),
            _ => unknown("lakeshore335", command),
        }
    }
}

#[derive(Default)]
struct SimAmi430 {
    field: f64,
    rate: f64,
}

impl SimulatedInstrument for SimAmi430 {
    fn handle(&mut self, command: &str) -> Result<Option<String>> {
        let command = command.trim_end_matches(';');
        match command {
            "FIELD:MAG?" | "FIELD:TARG?" => return Ok(Some(format!("{:.6}", self.field))),
            "STATE?" => return Ok(Some("2".into())),
            "RAMP:RATE:FIELD:1?" => return Ok(Some(format!("{},1", self.rate))),
            "RAMP" | "PAUSE" => return Ok(None),
            _ => {}
        }
        if let Some(value) = arg(command, "CONFIGURE:FIELD:TARGET ") {
            self.field = number(value)?;
        } else if let Some(values) = arg(command, "CONFIGURE:RAMP:RATE:FIELD ") {
            let rate = values.split(',').nth(1).unwrap_or("0");
            self.rate = number(rate)?;
        } else {
            return unknown("ami430", command);
        }
        Ok(None)
    }
}

struct SimYokogawa {
    function: String,
    level: f64,
    output: bool,
}

impl Default for SimYokogawa {
    fn default() -> Self {
        Self {
            function: "VOLT".into(),
            level: 0.0,
            output: false,
        }
    }
}

impl SimulatedInstrument for SimYokogawa {
    fn handle(&mut self, command: &str) -> Result<Option<String>> {
        match command {
            ":SOUR:FUNC?" => return Ok(Some(self.function.clone())),
            ":OUTP?" => return Ok(Some(u8::from(self.output).to_string())),
            ":SOURCE:LEVEL?" => return Ok(Some(format!("{:e}", self.level))),
            _ => {}
        }
        if let Some(function) = arg(command, ":SOUR:FUNC ") {
            self.function = function.to_uppercase();
        } else if let Some(value) = arg(command, ":SOURCE:LEVEL ") {
            self.level = number(value)?;
        } else if let Some(value) = arg(command, ":OUTP ") {
            self.output = number(value)? != 0.0;
        } else {
            return unknown("yokogawa", command);
        }
        Ok(None)
    }
}

struct SimKeithley2000;

impl SimulatedInstrument for SimKeithley2000 {
    fn handle(&mut self, command: &str) -> Result<Option<String>> {
        match command {
            ":DATA?" => Ok(Some("+1.234560E+03".into())),
            _ => unknown("keithley2000", command),
        }
    }
}

struct SimKeithley6430;

impl SimulatedInstrument for SimKeithley6430 {
    fn handle(&mut self, command: &str) -> Result<Option<String>> {
        match command {
            ":READ?" => Ok(Some(
                "+1.000000E-03,+1.000000E-06,+1.000000E+03,+2.5E+02,+0.0E+00".into(),
            )),
            _ => unknown("keithley6430", command),
        }
    }
}

#[derive(Default)]
struct SimKeithley6221 {
    points: usize,
    armed: bool,
    running: bool,
}

impl SimulatedInstrument for SimKeithley6221 {
    fn handle(&mut self, command: &str) -> Result<Option<String>> {
        match command {
            "*RST" | "UNIT OHMS" => return Ok(None),
            "SOUR:DCON:ARM" => {
                self.armed = true;
                return Ok(None);
            }
            "SOUR:DCON:ARM?" => return Ok(Some(u8::from(self.armed).to_string())),
            "INIT:IMM" => {
                self.running = self.armed;
                return Ok(None);
            }
            // Sweeps finish instantly: report "sweep done"
            "STAT:OPER:COND?" => {
                let bits = if self.running { 0b0010 } else { 0 };
                return Ok(Some(bits.to_string()));
            }
            "SOUR:DCON:NVZ?" => return Ok(Some("+1.500000E-06".into())),
            "TRAC:DATA?" => {
                let pairs: Vec<String> = (0..self.points)
                    .map(|i| format!("{:e},{:e}", 100.0 + i as f64, i as f64 * 0.05))
                    .collect();
                return Ok(Some(pairs.join(",")));
            }
            "SOUR:SWE:ABOR" => {
                self.armed = false;
                self.running = false;
                return Ok(None);
            }
            _ => {}
        }
        if let Some(points) = arg(command, "TRAC:POIN ") {
            self.points = number(points)? as usize;
            return Ok(None);
        }
        if command.starts_with("SOUR:DCON:") {
            return Ok(None);
        }
        unknown("keithley6221", command)
    }
}

#[derive(Default)]
struct SimMss {
    field: f64,
    temperature: f64,
}

impl SimulatedInstrument for SimMss {
    fn handle(&mut self, command: &str) -> Result<Option<String>> {
        match command {
            "READ? BA" | "READ? BD" => return Ok(Some(format!("{:.5},0", self.field))),
            "READ? TA" | "READ? TB" => {
                let t = if self.temperature == 0.0 {
                    1.8
                } else {
                    self.temperature
                };
                return Ok(Some(format!("{:.4},0", t)));
            }
            "STAB? B" | "STAB? TB" | "STAB? TA" => return Ok(Some("TRUE".into())),
            _ => {}
        }
        if let Some(values) = arg(command, "SET B") {
            self.field = number(values.split(',').next().unwrap_or("0"))?;
        } else if let Some(values) = arg(command, "SET T") {
            self.temperature = number(values.split(',').next().unwrap_or("0"))?;
        } else {
            return unknown("mss", command);
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_transport_records_commands() {
        let mut transport = MockTransport::new(|cmd| match cmd {
            "*IDN?" => Ok(Some("MOCK".into())),
            _ => Ok(None),
        });
        let log = transport.log();

        transport.write("*CLS").await.unwrap();
        assert_eq!(transport.query("*IDN?").await.unwrap(), "MOCK");
        assert!(transport.query("NOREPLY?").await.is_err());
        assert_eq!(log.commands(), vec!["*CLS", "*IDN?", "NOREPLY?"]);
        assert_eq!(log.count("*"), 2);
    }

    #[tokio::test]
    async fn test_simulated_lockin_sensitivity() {
        let mut lockin = simulated(SimulatedModel::Sr830);
        assert_eq!(lockin.query("SENS?").await.unwrap(), "20");
        lockin.write("SENS 21").await.unwrap();
        assert_eq!(lockin.query("SENS?").await.unwrap(), "21");
        assert!(lockin.write("BOGUS").await.is_err());
    }

    #[tokio::test]
    async fn test_simulated_bridge_autoscan_advances() {
        let mut bridge = simulated(SimulatedModel::LakeShore370);
        bridge.write("SCAN 1,1").await.unwrap();
        assert_eq!(bridge.query("SCAN?").await.unwrap(), "01,1");
        assert_eq!(bridge.query("SCAN?").await.unwrap(), "02,1");
        bridge.write("SCAN 6,0").await.unwrap();
        assert_eq!(bridge.query("SCAN?").await.unwrap(), "06,0");
        assert_eq!(bridge.query("SCAN?").await.unwrap(), "06,0");
    }

    #[tokio::test]
    async fn test_simulated_magnet_reaches_target() {
        let mut magnet = simulated(SimulatedModel::Ami430);
        magnet
            .write("CONFIGURE:RAMP:RATE:FIELD 1,0.1,1;")
            .await
            .unwrap();
        magnet.write("CONFIGURE:FIELD:TARGET 0.5;").await.unwrap();
        assert_eq!(magnet.query("FIELD:MAG?").await.unwrap(), "0.500000");
        assert_eq!(magnet.query("RAMP:RATE:FIELD:1?").await.unwrap(), "0.1,1");
    }
}
