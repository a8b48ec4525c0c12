//! Monitoring facade.
//!
//! A cheap, synchronous view of the rig for status pages and the CLI: whether
//! an acquisition is running, the program state and the latest committed
//! sample. Nothing here touches the instrument bus.

use crate::interpreter::{EngineSlot, ProgramState};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tokio::sync::watch;

/// Message reported while an acquisition is active.
pub const RUNNING: &str = "Experiment running";
/// Message reported otherwise.
pub const STOPPED: &str = "Experiment stopped";

/// Snapshot returned by [`Monitor::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    /// [`RUNNING`] or [`STOPPED`]
    pub message: String,
    /// Program state, human readable
    pub program: String,
    /// Latest value per channel; empty when stopped
    pub channels: BTreeMap<String, Option<f64>>,
}

impl StatusReport {
    /// Flat `field -> value` map; missing readings become JSON null.
    pub fn to_flat_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("message".into(), Value::from(self.message.clone()));
        map.insert("program".into(), Value::from(self.program.clone()));
        for (name, value) in &self.channels {
            map.insert(name.clone(), value.map_or(Value::Null, Value::from));
        }
        map
    }
}

/// Read-only handle on the session state.
#[derive(Clone)]
pub struct Monitor {
    engine: EngineSlot,
    program: watch::Receiver<ProgramState>,
}

impl Monitor {
    /// Monitor over an engine slot and a program state channel.
    pub fn new(engine: EngineSlot, program: watch::Receiver<ProgramState>) -> Self {
        Self { engine, program }
    }

    /// Current program state.
    pub fn program_state(&self) -> ProgramState {
        *self.program.borrow()
    }

    /// Snapshot of the rig.
    pub fn status(&self) -> StatusReport {
        let program = self.program_state().to_string();
        let slot = self.engine.lock().unwrap_or_else(|p| p.into_inner());
        match slot.as_ref().filter(|handle| !handle.is_finished()) {
            Some(handle) => {
                let latest = handle.latest();
                let channels = handle
                    .layout()
                    .names()
                    .enumerate()
                    .map(|(i, name)| {
                        let value = latest.as_ref().and_then(|s| s.values.get(i).copied().flatten());
                        (name.to_string(), value)
                    })
                    .collect();
                StatusReport {
                    message: RUNNING.into(),
                    program,
                    channels,
                }
            }
            None => StatusReport {
                message: STOPPED.into(),
                program,
                channels: BTreeMap::new(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_stopped_report() {
        let (_tx, rx) = watch::channel(ProgramState::Complete);
        let monitor = Monitor::new(Arc::new(Mutex::new(None)), rx);
        let report = monitor.status();
        assert_eq!(report.message, STOPPED);
        assert_eq!(report.program, "Complete");
        assert!(report.channels.is_empty());
    }

    #[test]
    fn test_flat_map_uses_null_for_missing() {
        let report = StatusReport {
            message: RUNNING.into(),
            program: "Running (line 3)".into(),
            channels: BTreeMap::from([("T".to_string(), Some(0.0125)), ("U2".to_string(), None)]),
        };
        let map = report.to_flat_map();
        assert_eq!(map["message"], Value::from(RUNNING));
        assert_eq!(map["T"], Value::from(0.0125));
        assert_eq!(map["U2"], Value::Null);
        assert_eq!(map.len(), 4);
    }
}
