//! Data acquisition.
//!
//! - [`engine`]: the sampling task and its handle
//! - [`series`]: in-memory sample columns and step aggregates
//! - [`sweep`]: stepped sweep window bookkeeping
//! - [`overload`]: lock-in overload counters
//! - [`storage`]: tab-separated data files

pub mod engine;
pub mod overload;
pub mod series;
pub mod storage;
pub mod sweep;

pub use engine::{AcquisitionEngine, EngineHandle, EngineSettings, Protocol};
pub use series::{Aggregate, Sample, SampleSeries};
pub use sweep::StepSweep;
