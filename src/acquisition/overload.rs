//! Lock-in output overload tracking.
//!
//! Each lock-in has its own counter of consecutive status checks flagging an
//! output overload. Reaching the threshold with autorange on asks for exactly one
//! range increase and resets the counter; with autorange off the condition is
//! only reported once and the counter keeps running.

use crate::hardware::sr830::LockinStatus;

/// Action for one lock-in after a status check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverloadVerdict {
    /// Nothing to do
    Clear,
    /// Overloaded, below threshold
    Counting(u32),
    /// Threshold reached, raise the range
    RangeUp,
    /// Threshold reached, autorange disabled
    Report,
}

/// Per lock-in consecutive overload counters.
#[derive(Debug, Clone)]
pub struct OverloadMonitor {
    counters: Vec<u32>,
    threshold: u32,
    autorange: bool,
}

impl OverloadMonitor {
    /// Monitor for `lockins` lock-ins.
    pub fn new(lockins: usize, threshold: u32, autorange: bool) -> Self {
        Self {
            counters: vec![0; lockins],
            threshold: threshold.max(1),
            autorange,
        }
    }

    /// Record one status check of lock-in `index`.
    pub fn record(&mut self, index: usize, status: LockinStatus) -> OverloadVerdict {
        let Some(counter) = self.counters.get_mut(index) else {
            return OverloadVerdict::Clear;
        };
        if !status.output_overload() {
            *counter = 0;
            return OverloadVerdict::Clear;
        }
        *counter += 1;
        if *counter < self.threshold {
            return OverloadVerdict::Counting(*counter);
        }
        if self.autorange {
            *counter = 0;
            OverloadVerdict::RangeUp
        } else if *counter == self.threshold {
            OverloadVerdict::Report
        } else {
            OverloadVerdict::Counting(*counter)
        }
    }

    /// Current counter of lock-in `index`.
    pub fn count(&self, index: usize) -> u32 {
        self.counters.get(index).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUT: LockinStatus = LockinStatus(0b100);
    const CLEAN: LockinStatus = LockinStatus(0);

    #[test]
    fn test_autorange_fires_once_and_resets() {
        let mut monitor = OverloadMonitor::new(2, 3, true);
        assert_eq!(monitor.record(0, OUT), OverloadVerdict::Counting(1));
        assert_eq!(monitor.record(0, OUT), OverloadVerdict::Counting(2));
        assert_eq!(monitor.record(0, OUT), OverloadVerdict::RangeUp);
        assert_eq!(monitor.count(0), 0);
        assert_eq!(monitor.record(0, OUT), OverloadVerdict::Counting(1));
    }

    #[test]
    fn test_autorange_off_reports_once() {
        let mut monitor = OverloadMonitor::new(1, 3, false);
        monitor.record(0, OUT);
        monitor.record(0, OUT);
        assert_eq!(monitor.record(0, OUT), OverloadVerdict::Report);
        assert_eq!(monitor.record(0, OUT), OverloadVerdict::Counting(4));
    }

    #[test]
    fn test_clean_check_resets_and_counters_are_independent() {
        let mut monitor = OverloadMonitor::new(2, 3, true);
        monitor.record(0, OUT);
        monitor.record(1, OUT);
        monitor.record(0, OUT);
        assert_eq!(monitor.record(0, CLEAN), OverloadVerdict::Clear);
        assert_eq!(monitor.count(0), 0);
        assert_eq!(monitor.count(1), 1);
        // Input overload alone does not count.
        assert_eq!(monitor.record(1, LockinStatus(0b1)), OverloadVerdict::Clear);
    }
}
