//! # Rig DAQ Core Library
//!
//! Scripted experiment control and data acquisition for a cryogenic transport
//! rig. A short instruction script (ramp the field, wait, sweep a parameter,
//! start logging) is checked in a dry run, then executed while an acquisition
//! engine samples the instruments in the background and writes tab-separated
//! data files.
//!
//! ## Crate Structure
//!
//! - **`error`**: the `DaqError` taxonomy and `AppResult<T>`.
//! - **`config`**: Figment-based `RigConfig` (TOML file plus `RIG_DAQ_` environment
//!   overrides).
//! - **`logging`**: tracing-subscriber initialisation.
//! - **`hardware`**: the instrument broker, transports and instrument drivers.
//! - **`facility`**: the `Facility` trait and one implementation per measurement site.
//! - **`acquisition`**: the acquisition engine, sample series, step sweeps,
//!   overload counters and TSV storage.
//! - **`interpreter`**: script parsing and the shared dry-run / live evaluator.
//! - **`session`**: the object owning facility, engine slot and program task.
//! - **`monitor`**: a read-only view of the latest sample and program state.

pub mod acquisition;
pub mod config;
pub mod error;
pub mod facility;
pub mod hardware;
pub mod interpreter;
pub mod logging;
pub mod monitor;
pub mod session;

pub use error::{AppResult, DaqError};
pub use session::Session;
