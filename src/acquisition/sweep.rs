//! Stepped sweep bookkeeping.
//!
//! The sweep consumes a FIFO of targets. Entering a target opens a window: ticks
//! during the first `relax` seconds are dropped, ticks after that are kept, and
//! the tick on which `relax + measure` has elapsed closes the window. Closing
//! yields one aggregate over the kept ticks and immediately enters the next
//! target on the same tick.
//!
//! The state machine only classifies ticks; the engine performs the device
//! action for each entered target and reports failures back through
//! [`StepSweep::entry_failed`].

use super::series::{Aggregate, SampleSeries};
use crate::facility::StepParameter;
use std::collections::VecDeque;

/// What the engine must do with the tick it just appended.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    /// Keep and persist the tick; otherwise remove it from the series
    pub persist: bool,
    /// Closed window: stepped value and per-channel aggregates
    pub aggregate: Option<(f64, Vec<Aggregate>)>,
    /// Target to apply to the device now
    pub enter: Option<f64>,
    /// No targets left, the engine stops after this tick
    pub finished: bool,
}

#[derive(Debug, Clone, Copy)]
struct StepWindow {
    target: f64,
    entered_at: f64,
    first_index: Option<usize>,
}

/// Stepped sweep state.
#[derive(Debug, Clone)]
pub struct StepSweep {
    parameter: StepParameter,
    targets: VecDeque<f64>,
    relax: f64,
    measure: f64,
    window: Option<StepWindow>,
}

impl StepSweep {
    /// Sweep of `parameter` over `targets`, times in seconds.
    pub fn new(parameter: StepParameter, targets: Vec<f64>, relax: f64, measure: f64) -> Self {
        Self {
            parameter,
            targets: targets.into(),
            relax,
            measure,
            window: None,
        }
    }

    /// Stepped quantity.
    pub fn parameter(&self) -> StepParameter {
        self.parameter
    }

    /// Targets not yet closed, including the one in progress.
    pub fn remaining(&self) -> usize {
        self.targets.len()
    }

    /// Classify the tick at `now` (seconds since start), already appended to `series`.
    pub fn on_tick(&mut self, now: f64, series: &SampleSeries) -> StepOutcome {
        let mut outcome = StepOutcome::default();

        if let Some(window) = &mut self.window {
            let elapsed = now - window.entered_at;
            if elapsed < self.relax {
                return outcome;
            }
            outcome.persist = true;
            let first = *window
                .first_index
                .get_or_insert(series.len().saturating_sub(1));
            if elapsed < self.relax + self.measure {
                return outcome;
            }
            outcome.aggregate = Some((window.target, series.aggregate_from(first)));
            self.targets.pop_front();
        }

        match self.targets.front() {
            Some(&target) => {
                self.window = Some(StepWindow {
                    target,
                    entered_at: now,
                    first_index: None,
                });
                outcome.enter = Some(target);
            }
            None => {
                self.window = None;
                outcome.finished = true;
            }
        }
        outcome
    }

    /// The device action for the entered target failed; retry it next tick.
    pub fn entry_failed(&mut self) {
        self.window = None;
    }
}
