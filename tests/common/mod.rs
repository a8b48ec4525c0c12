//! Shared helpers for integration tests.

#![allow(dead_code)]

use rig_daq::acquisition::EngineSettings;
use rig_daq::facility::bench::BenchFacility;
use rig_daq::interpreter::Interpreter;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// One-second ticks, status checks every tick, data under `dir`.
pub fn settings(dir: &Path) -> EngineSettings {
    EngineSettings {
        tick_interval: Duration::from_secs(1),
        status_check_every: 1,
        overload_threshold: 3,
        field_step_rate: 0.01,
        autorange: true,
        data_dir: dir.to_path_buf(),
        sample: "S".into(),
    }
}

/// Interpreter over `bench` polling every second.
pub fn interpreter(bench: &Arc<BenchFacility>, dir: &Path) -> Interpreter {
    Interpreter::new(bench.clone(), settings(dir))
        .with_timing(Duration::from_secs(1), Duration::from_secs(2))
}

/// Data rows of a TSV file (header rows skipped).
pub fn data_rows(path: &Path) -> Vec<Vec<String>> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .skip(2)
        .map(|l| l.split('\t').map(str::to_string).collect())
        .collect()
}
