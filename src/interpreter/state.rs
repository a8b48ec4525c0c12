//! Program state published to the monitoring facade.

use serde::{Deserialize, Serialize};

/// Lifecycle of one script execution.
///
/// # State Machine
///
/// ```text
/// Idle ──check──> Checking ──ok──> Running{line} ──end of script──> Complete
///                    │                 │
///                 syntax            cancel ──> Interrupted
///                    │                 │
///                    └────> Failed <───┘ fault
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgramState {
    /// No program has run yet
    Idle,
    /// Dry-run validation in progress
    Checking,
    /// Live execution, at the given 1-based script line
    Running {
        /// Line being executed
        line: usize,
    },
    /// All commands executed
    Complete,
    /// Cancelled before the end of the script
    Interrupted,
    /// Aborted by a fault
    Failed,
}

impl std::fmt::Display for ProgramState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgramState::Idle => write!(f, "Idle"),
            ProgramState::Checking => write!(f, "Checking"),
            ProgramState::Running { line } => write!(f, "Running (line {})", line),
            ProgramState::Complete => write!(f, "Complete"),
            ProgramState::Interrupted => write!(f, "Interrupted"),
            ProgramState::Failed => write!(f, "Failed"),
        }
    }
}

impl ProgramState {
    /// True while a script is being checked or executed.
    pub fn is_active(&self) -> bool {
        matches!(self, ProgramState::Checking | ProgramState::Running { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_activity() {
        assert_eq!(ProgramState::Running { line: 4 }.to_string(), "Running (line 4)");
        assert!(ProgramState::Checking.is_active());
        assert!(!ProgramState::Interrupted.is_active());
    }
}
