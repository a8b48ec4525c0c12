//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the entire application.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the kinds of errors that can occur while a script runs against the rig.
//!
//! ## Error Hierarchy
//!
//! - **`Syntax`**: A script line failed validation (arity, number parsing, unit literals,
//!   or a missing prerequisite `config` value). Carries the 1-based line number and the
//!   usage hint for the offending operation. Always aborts the whole run, in dry-run and
//!   live mode alike.
//! - **`Instrument`**: Any communication or device-level failure. At tick granularity the
//!   acquisition engine discards the tick and continues; at startup it aborts the engine
//!   start and the live run.
//! - **`State`**: An operation that conflicts with the current session state, such as
//!   starting a second acquisition while one is active.
//! - **`Config`** / **`Configuration`**: Parse errors from `figment` and semantic
//!   validation errors respectively.
//! - **`Io`** / **`Storage`**: File system and TSV writer failures.
//! - **`FeatureNotEnabled`**: A transport or storage backend that was compiled out.
//!
//! Driver code works with `anyhow::Result` and is mapped into `DaqError::Instrument`
//! at the engine and interpreter boundary.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Script validation failure.
    #[error("Syntax error on line {line}: {reason}. Usage: {usage}")]
    Syntax {
        /// 1-based script line.
        line: usize,
        /// What was wrong with the line.
        reason: String,
        /// Usage hint for the operation.
        usage: &'static str,
    },

    /// Device or bus failure.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// Operation not allowed in the current session state.
    #[error("State error: {0}")]
    State(String),

    /// Configuration file or environment could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration parsed but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File system failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Data file writer failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Functionality compiled out via cargo features.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl DaqError {
    /// Wraps a driver-level error, keeping the whole context chain.
    pub fn instrument(err: anyhow::Error) -> Self {
        DaqError::Instrument(format!("{err:#}"))
    }

    /// True for script validation failures.
    pub fn is_syntax(&self) -> bool {
        matches!(self, DaqError::Syntax { .. })
    }
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

#[cfg(feature = "storage_csv")]
impl From<csv::Error> for DaqError {
    fn from(value: csv::Error) -> Self {
        DaqError::Storage(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn syntax_error_mentions_line_and_usage() {
        let err = DaqError::Syntax {
            line: 4,
            reason: "unknown unit 'parsec'".into(),
            usage: "wait <n> <s|m|h>",
        };
        let text = err.to_string();
        assert!(text.contains("line 4"));
        assert!(text.contains("parsec"));
        assert!(text.contains("wait <n>"));
        assert!(err.is_syntax());
    }

    #[test]
    fn instrument_error_keeps_context_chain() {
        let inner: anyhow::Result<()> = Err(anyhow::anyhow!("timeout"));
        let err = DaqError::instrument(inner.context("query 'LIAS?' on r1").unwrap_err());
        match err {
            DaqError::Instrument(msg) => {
                assert!(msg.contains("LIAS?"));
                assert!(msg.contains("timeout"));
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: DaqError = io.into();
        assert!(matches!(err, DaqError::Io(_)));
        assert!(!err.is_syntax());
    }
}
