//! Lifecycle state machines for runs and steps.
//!
//! Two independent finite-state machines, each a static transition
//! table. Every status mutation in the engine consults these tables
//! before touching persisted state; an invalid transition request is
//! rejected with [`StateTransitionError`] and mutates nothing.

use crate::StateTransitionError;
use serde::{Deserialize, Serialize};

// ── Run status ───────────────────────────────────────────────────────

/// Lifecycle status of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Admitted and persisted, waiting for a worker
    #[default]
    Pending,
    /// Actively executing steps
    Running,
    /// All steps completed or skipped, zero failures
    Completed,
    /// At least one step failed, or the run was failed directly
    Failed,
    /// Cancelled from outside the normal execution path
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Step status ──────────────────────────────────────────────────────

/// Lifecycle status of a run step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Created, not yet offered to a worker
    #[default]
    Pending,
    /// Currently executing inside the sandbox
    Running,
    /// Finished successfully, outputs persisted
    Completed,
    /// Finished with an error
    Failed,
    /// Never executed (replay prefix or explicit skip)
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Transition tables ────────────────────────────────────────────────

/// Static transition table for the run lifecycle.
pub struct RunLifecycle;

impl RunLifecycle {
    /// Valid targets from a given status. Terminal states return empty.
    pub fn valid_transitions(from: RunStatus) -> &'static [RunStatus] {
        match from {
            RunStatus::Pending => &[RunStatus::Running, RunStatus::Cancelled],
            RunStatus::Running => &[
                RunStatus::Completed,
                RunStatus::Failed,
                RunStatus::Cancelled,
            ],
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled => &[],
        }
    }

    pub fn can_transition(from: RunStatus, to: RunStatus) -> bool {
        Self::valid_transitions(from).contains(&to)
    }

    /// Table check that produces the engine-wide transition error.
    pub fn check(from: RunStatus, to: RunStatus) -> Result<(), StateTransitionError> {
        if Self::can_transition(from, to) {
            Ok(())
        } else {
            Err(StateTransitionError::run(from, to))
        }
    }
}

/// Static transition table for the step lifecycle.
pub struct StepLifecycle;

impl StepLifecycle {
    /// Valid targets from a given status. Terminal states return empty.
    pub fn valid_transitions(from: StepStatus) -> &'static [StepStatus] {
        match from {
            StepStatus::Pending => &[StepStatus::Running, StepStatus::Skipped],
            StepStatus::Running => &[StepStatus::Completed, StepStatus::Failed],
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped => &[],
        }
    }

    pub fn can_transition(from: StepStatus, to: StepStatus) -> bool {
        Self::valid_transitions(from).contains(&to)
    }

    pub fn check(from: StepStatus, to: StepStatus) -> Result<(), StateTransitionError> {
        if Self::can_transition(from, to) {
            Ok(())
        } else {
            Err(StateTransitionError::step(from, to))
        }
    }
}
