//! Hardware layer.
//!
//! Transports move ASCII commands to instruments, the [`broker`] serializes every
//! transaction on the shared bus, and the driver modules wrap each instrument's
//! command set in typed methods.

pub mod ami430;
pub mod broker;
pub mod keithley;
pub mod lakeshore;
pub mod mock;
pub mod mss;
#[cfg(feature = "instrument_serial")]
pub mod serial;
pub mod sr830;
pub mod transport;
#[cfg(feature = "instrument_visa")]
pub mod visa;
pub mod yokogawa;

pub use broker::{BusGuard, InstrumentBroker};
pub use transport::Transport;

use std::fmt;
use std::str::FromStr;

/// Step direction for ranges and excitations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Next higher index
    Up,
    /// Next lower index
    Down,
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "up" => Ok(Direction::Up),
            "down" => Ok(Direction::Down),
            other => Err(format!("expected up or down, got '{}'", other)),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "up"),
            Direction::Down => write!(f, "down"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_parse() {
        assert_eq!("UP".parse::<Direction>(), Ok(Direction::Up));
        assert_eq!("down".parse::<Direction>(), Ok(Direction::Down));
        assert!("sideways".parse::<Direction>().is_err());
    }
}
