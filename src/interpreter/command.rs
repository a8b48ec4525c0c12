//! Script command parsing.
//!
//! Each non-empty line is split on whitespace; the first token names the
//! operation. Parsing checks arity, numbers, literals and units, and converts
//! every quantity to SI-ish base units (seconds, tesla, T/min, kelvin, K/min,
//! volts, amperes). Checks that depend on earlier lines (for example
//! `current-field` having been configured) happen in the evaluator.

use crate::error::{AppResult, DaqError};
use crate::facility::{DeltaPlan, StepParameter, MAX_LOCKINS};
use crate::hardware::sr830::Expand;
use crate::hardware::Direction;
use std::time::Duration;

pub const USAGE_CONFIG: &str =
    "config <step-relax|step-measure|current-field|current-temperature|autorange> <value>";
pub const USAGE_START_SIMPLE: &str = "start-simple <NAME>";
pub const USAGE_START_COOLDOWN: &str = "start-cooldown <NAME>";
pub const USAGE_START_STEP: &str = "start-step <NAME> <AMP-R1|AMP-ALL|FREQ|VG|H|HEATER> <FROM>..<TO> <POINTS>*<ZIGZAG>";
pub const USAGE_START_DIDV: &str = "start-didv <NAME> <FROM>..<TO> <POINTS> with delta <DELTA>";
pub const USAGE_STOP: &str = "stop";
pub const USAGE_WAIT: &str = "wait <time> <s|sec|seconds|m|min|minute|minutes|h|hour|hours>";
pub const USAGE_WAIT_FOR_FIELD: &str = "wait-for-field";
pub const USAGE_WAIT_FOR_TEMPERATURE: &str = "wait-for-temperature";
pub const USAGE_WAIT_FOR_PROGRAM: &str = "wait-for-program";
pub const USAGE_SET_GATE_VOLTAGE: &str = "set-gate-voltage <voltage> <V|mV>";
pub const USAGE_SET_GATE_CURRENT: &str = "set-gate-current <current> <A|mA>";
pub const USAGE_SET_GATE_STATE: &str = "set-gate-state <0|1>";
pub const USAGE_SET_TARGET_FIELD: &str =
    "set-target-field <field> <T|Oe> with rate <rate> <T/min|Oe/min>";
pub const USAGE_SET_TARGET_TEMPERATURE: &str =
    "set-target-temperature <temp> <K|mK> with rate <rate> <K/min|mK/min>";
pub const USAGE_SET_AMPLITUDE: &str = "set-amplitude <volts>";
pub const USAGE_SET_FREQUENCY: &str = "set-frequency <hertz>";
pub const USAGE_SET_OFFSET_AND_EXPAND: &str =
    "set-offset-and-expand <R1|R2|R3|R4> <on|off> <1x|10x|100x>";
pub const USAGE_TC_CHANNEL: &str = "tc-channel <channel>";
pub const USAGE_TC_CURRENT: &str = "tc-current <up|down>";
pub const USAGE_SET_RNG: &str = "set-rng <channel> <up|down>";
pub const USAGE_UNKNOWN: &str = "config, start-simple, start-cooldown, start-step, start-didv, stop, wait, wait-for-field, wait-for-temperature, wait-for-program, set-gate-voltage, set-gate-current, set-gate-state, set-target-field, set-target-temperature, set-amplitude, set-frequency, set-offset-and-expand, tc-channel, tc-current, set-rng";

/// `config` parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConfigParam {
    /// Seconds discarded after each step
    StepRelax(f64),
    /// Seconds averaged after the relax period
    StepMeasure(f64),
    /// Field the magnet is at, tesla
    CurrentField(f64),
    /// Temperature the sample is at, kelvin
    CurrentTemperature(f64),
    /// Lock-in autorange on overload
    Autorange(bool),
}

/// One parsed script line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Set a run configuration value
    Config(ConfigParam),
    /// Continuous acquisition
    StartSimple {
        /// Acquisition name
        name: String,
    },
    /// Autoscan-following acquisition
    StartCooldown {
        /// Acquisition name
        name: String,
    },
    /// Stepped sweep
    StartStep {
        /// Acquisition name
        name: String,
        /// Stepped quantity
        parameter: StepParameter,
        /// Expanded list of targets
        targets: Vec<f64>,
    },
    /// Differential conductance sweep
    StartDidv {
        /// Acquisition name
        name: String,
        /// Sweep settings
        plan: DeltaPlan,
    },
    /// Stop the active acquisition
    Stop,
    /// Sleep
    Wait {
        /// Duration in seconds
        seconds: f64,
    },
    /// Block until the magnet stops ramping
    WaitForField,
    /// Block until the temperature stops ramping
    WaitForTemperature,
    /// Block until the active acquisition finishes
    WaitForProgram,
    /// Gate source voltage
    SetGateVoltage {
        /// Volts
        volts: f64,
    },
    /// Gate source current
    SetGateCurrent {
        /// Amperes
        amps: f64,
    },
    /// Gate output on/off
    SetGateState {
        /// Output enabled
        on: bool,
    },
    /// Ramp the magnet
    SetTargetField {
        /// Target, tesla
        tesla: f64,
        /// Rate, T/min
        rate: f64,
    },
    /// Ramp the temperature
    SetTargetTemperature {
        /// Target, kelvin
        kelvin: f64,
        /// Rate, K/min
        rate: f64,
    },
    /// Lock-in R1 amplitude
    SetAmplitude {
        /// Volts
        volts: f64,
    },
    /// Lock-in R1 frequency
    SetFrequency {
        /// Hertz
        hertz: f64,
    },
    /// Offset and expand of one lock-in
    SetOffsetExpand {
        /// Lock-in index, 0 = R1
        lockin: usize,
        /// Expand factor, `None` = off
        expand: Option<Expand>,
    },
    /// Park the scanner on a channel
    TcChannel {
        /// Scanner channel
        channel: u8,
    },
    /// Step the excitation of the current scanner channel
    TcCurrent {
        /// Step direction
        direction: Direction,
    },
    /// Step the resistance range of a channel
    SetRange {
        /// Bridge channel
        channel: u8,
        /// Step direction
        direction: Direction,
    },
}

impl Command {
    /// Parse the tokens of line `line` (1-based); `op` is the first token.
    pub fn parse(line: usize, op: &str, args: &[&str]) -> AppResult<Self> {
        let fail = |usage: &'static str, reason: &str| DaqError::Syntax {
            line,
            reason: reason.to_string(),
            usage,
        };
        match op {
            "config" => {
                let [name, value] = args else {
                    return Err(fail(USAGE_CONFIG, "expected a parameter name and a value"));
                };
                let number = || {
                    finite(value, || fail(USAGE_CONFIG, &format!("'{}' is not a number", value)))
                };
                let param = match *name {
                    "step-relax" => ConfigParam::StepRelax(non_negative(number()?, || {
                        fail(USAGE_CONFIG, "step-relax must not be negative")
                    })?),
                    "step-measure" => ConfigParam::StepMeasure(non_negative(number()?, || {
                        fail(USAGE_CONFIG, "step-measure must not be negative")
                    })?),
                    "current-field" => ConfigParam::CurrentField(number()?),
                    "current-temperature" => ConfigParam::CurrentTemperature(number()?),
                    "autorange" => match value.to_ascii_lowercase().as_str() {
                        "on" | "1" => ConfigParam::Autorange(true),
                        "off" | "0" => ConfigParam::Autorange(false),
                        _ => return Err(fail(USAGE_CONFIG, "autorange must be on, off, 1 or 0")),
                    },
                    other => {
                        return Err(fail(
                            USAGE_CONFIG,
                            &format!("unknown parameter name '{}'", other),
                        ))
                    }
                };
                Ok(Command::Config(param))
            }
            "start-simple" | "start-cooldown" => {
                let usage = if op == "start-simple" {
                    USAGE_START_SIMPLE
                } else {
                    USAGE_START_COOLDOWN
                };
                let [name] = args else {
                    return Err(fail(usage, "expected exactly one name"));
                };
                let name = name.to_string();
                Ok(if op == "start-simple" {
                    Command::StartSimple { name }
                } else {
                    Command::StartCooldown { name }
                })
            }
            "start-step" => {
                let [name, parameter, range, points] = args else {
                    return Err(fail(USAGE_START_STEP, "expected 4 arguments"));
                };
                let parameter = parameter
                    .parse::<StepParameter>()
                    .map_err(|e| fail(USAGE_START_STEP, &e))?;
                let (from, to) =
                    parse_range(range).ok_or_else(|| fail(USAGE_START_STEP, "bad <FROM>..<TO>"))?;
                let (points, zigzag) = points
                    .split_once('*')
                    .and_then(|(p, z)| Some((p.parse::<usize>().ok()?, z.parse::<usize>().ok()?)))
                    .ok_or_else(|| fail(USAGE_START_STEP, "bad <POINTS>*<ZIGZAG>"))?;
                if points == 0 || zigzag == 0 {
                    return Err(fail(USAGE_START_STEP, "POINTS and ZIGZAG must be at least 1"));
                }
                Ok(Command::StartStep {
                    name: name.to_string(),
                    parameter,
                    targets: step_list(from, to, points, zigzag),
                })
            }
            "start-didv" => {
                let [name, range, points, "with", "delta", delta] = args else {
                    return Err(fail(USAGE_START_DIDV, "expected 6 arguments"));
                };
                let (start, stop) =
                    parse_range(range).ok_or_else(|| fail(USAGE_START_DIDV, "bad <FROM>..<TO>"))?;
                let points = points
                    .parse::<u32>()
                    .ok()
                    .filter(|p| *p > 0)
                    .ok_or_else(|| fail(USAGE_START_DIDV, "POINTS must be a positive integer"))?;
                let delta = finite(delta, || fail(USAGE_START_DIDV, "DELTA is not a number"))?;
                Ok(Command::StartDidv {
                    name: name.to_string(),
                    plan: DeltaPlan {
                        start,
                        stop,
                        points,
                        delta,
                    },
                })
            }
            "stop" => no_args(args, Command::Stop, || fail(USAGE_STOP, "takes no arguments")),
            "wait" => {
                let [amount, unit] = args else {
                    return Err(fail(USAGE_WAIT, "expected a time and a unit"));
                };
                let amount = finite(amount, || fail(USAGE_WAIT, "time is not a number"))?;
                let amount = non_negative(amount, || fail(USAGE_WAIT, "time must not be negative"))?;
                let scale = match *unit {
                    "s" | "sec" | "seconds" => 1.0,
                    "m" | "min" | "minute" | "minutes" => 60.0,
                    "h" | "hour" | "hours" => 3600.0,
                    other => return Err(fail(USAGE_WAIT, &format!("unknown unit '{}'", other))),
                };
                let seconds = amount * scale;
                if Duration::try_from_secs_f64(seconds).is_err() {
                    return Err(fail(USAGE_WAIT, "time is too large"));
                }
                Ok(Command::Wait { seconds })
            }
            "wait-for-field" => no_args(args, Command::WaitForField, || {
                fail(USAGE_WAIT_FOR_FIELD, "takes no arguments")
            }),
            "wait-for-temperature" => no_args(args, Command::WaitForTemperature, || {
                fail(USAGE_WAIT_FOR_TEMPERATURE, "takes no arguments")
            }),
            "wait-for-program" => no_args(args, Command::WaitForProgram, || {
                fail(USAGE_WAIT_FOR_PROGRAM, "takes no arguments")
            }),
            "set-gate-voltage" | "set-gate-current" => {
                let voltage = op == "set-gate-voltage";
                let usage = if voltage {
                    USAGE_SET_GATE_VOLTAGE
                } else {
                    USAGE_SET_GATE_CURRENT
                };
                let [value, unit] = args else {
                    return Err(fail(usage, "expected a value and a unit"));
                };
                let value = finite(value, || fail(usage, "value is not a number"))?;
                let (base, milli) = if voltage { ("v", "mv") } else { ("a", "ma") };
                let unit = unit.to_ascii_lowercase();
                let value = if unit == base {
                    value
                } else if unit == milli {
                    value * 1e-3
                } else {
                    return Err(fail(usage, &format!("unknown unit '{}'", unit)));
                };
                Ok(if voltage {
                    Command::SetGateVoltage { volts: value }
                } else {
                    Command::SetGateCurrent { amps: value }
                })
            }
            "set-gate-state" => match args {
                ["0"] => Ok(Command::SetGateState { on: false }),
                ["1"] => Ok(Command::SetGateState { on: true }),
                _ => Err(fail(USAGE_SET_GATE_STATE, "state must be 0 or 1")),
            },
            "set-target-field" => {
                let [value, unit, "with", "rate", rate, rate_unit] = args else {
                    return Err(fail(USAGE_SET_TARGET_FIELD, "expected 6 arguments"));
                };
                let tesla = finite(value, || fail(USAGE_SET_TARGET_FIELD, "field is not a number"))?
                    * match *unit {
                        "T" => 1.0,
                        "Oe" => 1e-4,
                        _ => return Err(fail(USAGE_SET_TARGET_FIELD, "field unit must be T or Oe")),
                    };
                let rate = positive(rate, || fail(USAGE_SET_TARGET_FIELD, "rate must be a positive number"))?
                    * match *rate_unit {
                        "T/min" => 1.0,
                        "Oe/min" => 1e-4,
                        _ => {
                            return Err(fail(
                                USAGE_SET_TARGET_FIELD,
                                "rate unit must be T/min or Oe/min",
                            ))
                        }
                    };
                Ok(Command::SetTargetField { tesla, rate })
            }
            "set-target-temperature" => {
                let [value, unit, "with", "rate", rate, rate_unit] = args else {
                    return Err(fail(USAGE_SET_TARGET_TEMPERATURE, "expected 6 arguments"));
                };
                let kelvin = finite(value, || {
                    fail(USAGE_SET_TARGET_TEMPERATURE, "temperature is not a number")
                })? * match *unit {
                        "K" => 1.0,
                        "mK" => 1e-3,
                        _ => {
                            return Err(fail(
                                USAGE_SET_TARGET_TEMPERATURE,
                                "temperature unit must be K or mK",
                            ))
                        }
                    };
                let rate = positive(rate, || {
                    fail(USAGE_SET_TARGET_TEMPERATURE, "rate must be a positive number")
                })? * match *rate_unit {
                    "K/min" => 1.0,
                    "mK/min" => 1e-3,
                    _ => {
                        return Err(fail(
                            USAGE_SET_TARGET_TEMPERATURE,
                            "rate unit must be K/min or mK/min",
                        ))
                    }
                };
                Ok(Command::SetTargetTemperature { kelvin, rate })
            }
            "set-amplitude" => match args {
                [value] => finite(value, || fail(USAGE_SET_AMPLITUDE, "cannot determine amplitude"))
                    .map(|volts| Command::SetAmplitude { volts }),
                _ => Err(fail(USAGE_SET_AMPLITUDE, "cannot determine amplitude")),
            },
            "set-frequency" => match args {
                [value] => finite(value, || fail(USAGE_SET_FREQUENCY, "cannot determine frequency"))
                    .map(|hertz| Command::SetFrequency { hertz }),
                _ => Err(fail(USAGE_SET_FREQUENCY, "cannot determine frequency")),
            },
            "set-offset-and-expand" => {
                let [lockin, state, expand] = args else {
                    return Err(fail(USAGE_SET_OFFSET_AND_EXPAND, "expected 3 arguments"));
                };
                let lockin = lockin
                    .to_ascii_lowercase()
                    .strip_prefix('r')
                    .and_then(|n| n.parse::<usize>().ok())
                    .filter(|n| (1..=MAX_LOCKINS).contains(n))
                    .ok_or_else(|| fail(USAGE_SET_OFFSET_AND_EXPAND, "lock-in must be R1..R4"))?;
                let factor = Expand::parse(expand)
                    .ok_or_else(|| fail(USAGE_SET_OFFSET_AND_EXPAND, "expand must be 1x, 10x or 100x"))?;
                let expand = match state.to_ascii_lowercase().as_str() {
                    "on" => Some(factor),
                    "off" => None,
                    _ => return Err(fail(USAGE_SET_OFFSET_AND_EXPAND, "state must be on or off")),
                };
                Ok(Command::SetOffsetExpand {
                    lockin: lockin - 1,
                    expand,
                })
            }
            "tc-channel" => match args {
                [channel] => channel
                    .parse::<u8>()
                    .map(|channel| Command::TcChannel { channel })
                    .map_err(|_| fail(USAGE_TC_CHANNEL, "cannot determine channel number")),
                _ => Err(fail(USAGE_TC_CHANNEL, "cannot determine channel number")),
            },
            "tc-current" => match args {
                [direction] => direction
                    .parse::<Direction>()
                    .map(|direction| Command::TcCurrent { direction })
                    .map_err(|e| fail(USAGE_TC_CURRENT, &e)),
                _ => Err(fail(USAGE_TC_CURRENT, "expected up or down")),
            },
            "set-rng" => {
                let [channel, direction] = args else {
                    return Err(fail(USAGE_SET_RNG, "expected a channel and a direction"));
                };
                let channel = channel
                    .parse::<u8>()
                    .map_err(|_| fail(USAGE_SET_RNG, "cannot determine channel number"))?;
                let direction = direction
                    .parse::<Direction>()
                    .map_err(|e| fail(USAGE_SET_RNG, &e))?;
                Ok(Command::SetRange { channel, direction })
            }
            other => Err(fail(USAGE_UNKNOWN, &format!("unknown command '{}'", other))),
        }
    }
}

/// `count` evenly spaced values from `from` to `to` inclusive.
pub fn linspace(from: f64, to: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![from],
        n => {
            let step = (to - from) / (n - 1) as f64;
            (0..n).map(|i| from + step * i as f64).collect()
        }
    }
}

/// Targets of a zigzag sweep: every odd pass runs backwards.
pub fn step_list(from: f64, to: f64, points: usize, zigzag: usize) -> Vec<f64> {
    let forward = linspace(from, to, points);
    (0..zigzag)
        .flat_map(|pass| {
            let mut values = forward.clone();
            if pass % 2 == 1 {
                values.reverse();
            }
            values
        })
        .collect()
}

fn parse_range(text: &str) -> Option<(f64, f64)> {
    let (from, to) = text.split_once("..")?;
    let from: f64 = from.parse().ok()?;
    let to: f64 = to.parse().ok()?;
    (from.is_finite() && to.is_finite()).then_some((from, to))
}

/// A number that is neither NaN nor infinite.
fn finite(text: &str, fail: impl FnOnce() -> DaqError) -> AppResult<f64> {
    match text.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(fail()),
    }
}

fn positive(text: &str, fail: impl FnOnce() -> DaqError) -> AppResult<f64> {
    match text.parse::<f64>() {
        Ok(value) if value.is_finite() && value > 0.0 => Ok(value),
        _ => Err(fail()),
    }
}

fn non_negative(value: f64, fail: impl FnOnce() -> DaqError) -> AppResult<f64> {
    if value >= 0.0 {
        Ok(value)
    } else {
        Err(fail())
    }
}

fn no_args(args: &[&str], command: Command, fail: impl FnOnce() -> DaqError) -> AppResult<Command> {
    if args.is_empty() {
        Ok(command)
    } else {
        Err(fail())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> AppResult<Command> {
        let mut tokens = line.split_whitespace();
        let op = tokens.next().unwrap();
        let args: Vec<&str> = tokens.collect();
        Command::parse(7, op, &args)
    }

    #[test]
    fn test_wait_units() {
        assert_eq!(parse("wait 90 s").unwrap(), Command::Wait { seconds: 90.0 });
        assert_eq!(parse("wait 1.5 m").unwrap(), Command::Wait { seconds: 90.0 });
        assert_eq!(parse("wait 2 hours").unwrap(), Command::Wait { seconds: 7200.0 });
        assert!(parse("wait 2 days").is_err());
    }

    #[test]
    fn test_wait_rejects_unusable_amounts() {
        for line in ["wait nan s", "wait inf s", "wait -1 s", "wait 1e300 s", "wait 1e18 h"] {
            let err = parse(line).unwrap_err();
            assert!(err.is_syntax(), "{} was accepted", line);
        }
        assert_eq!(parse("wait 0 s").unwrap(), Command::Wait { seconds: 0.0 });
    }

    #[test]
    fn test_targets_must_be_finite() {
        assert!(parse("set-target-field inf T with rate 1 T/min").is_err());
        assert!(parse("set-target-field 1 T with rate inf T/min").is_err());
        assert!(parse("set-target-temperature NaN K with rate 1 K/min").is_err());
        assert!(parse("config current-field inf").is_err());
    }

    #[test]
    fn test_step_list_zigzag() {
        assert_eq!(step_list(1.0, 2.0, 2, 1), vec![1.0, 2.0]);
        assert_eq!(step_list(0.0, 1.0, 3, 2), vec![0.0, 0.5, 1.0, 1.0, 0.5, 0.0]);
        assert_eq!(step_list(5.0, 9.0, 1, 3), vec![5.0, 5.0, 5.0]);
    }

    #[test]
    fn test_start_step() {
        let cmd = parse("start-step S amp-all 1.0..2.0 2*1").unwrap();
        assert_eq!(
            cmd,
            Command::StartStep {
                name: "S".into(),
                parameter: StepParameter::AmpAll,
                targets: vec![1.0, 2.0],
            }
        );
        assert!(parse("start-step S TEMP 1..2 2*1").is_err());
        assert!(parse("start-step S VG 1..2 0*1").is_err());
    }

    #[test]
    fn test_field_units_and_rate() {
        assert_eq!(
            parse("set-target-field 5000 Oe with rate 100 Oe/min").unwrap(),
            Command::SetTargetField {
                tesla: 0.5,
                rate: 0.01
            }
        );
        assert!(parse("set-target-field 1 T with rate 0 T/min").is_err());
        assert!(parse("set-target-field 1 t with rate 1 T/min").is_err());
    }

    #[test]
    fn test_gate_units_case_insensitive() {
        assert_eq!(
            parse("set-gate-voltage 250 MV").unwrap(),
            Command::SetGateVoltage { volts: 0.25 }
        );
        assert!(parse("set-gate-current 1 V").is_err());
        assert!(parse("set-gate-state 2").is_err());
    }

    #[test]
    fn test_offset_and_expand() {
        assert_eq!(
            parse("set-offset-and-expand r3 ON 10X").unwrap(),
            Command::SetOffsetExpand {
                lockin: 2,
                expand: Some(Expand::X10)
            }
        );
        assert!(parse("set-offset-and-expand R5 on 1x").is_err());
    }

    #[test]
    fn test_didv_and_ranges() {
        let cmd = parse("start-didv IV -1e-6..1e-6 101 with delta 1e-8").unwrap();
        match cmd {
            Command::StartDidv { plan, .. } => {
                assert_eq!(plan.points, 101);
                assert_eq!(plan.start, -1e-6);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            parse("set-rng 7 UP").unwrap(),
            Command::SetRange {
                channel: 7,
                direction: Direction::Up
            }
        );
    }

    #[test]
    fn test_unknown_command_carries_line() {
        match parse("levitate 3").unwrap_err() {
            DaqError::Syntax { line, .. } => assert_eq!(line, 7),
            other => panic!("unexpected {:?}", other),
        }
    }
}
