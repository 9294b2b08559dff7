//! Core error types shared across engine crates.

use crate::{RunStatus, StepStatus};

/// An invalid run/step status transition was requested.
///
/// Always recovered locally: the mutation is rejected and persisted
/// state is untouched. Under concurrent workers this is the expected
/// shape of a lost race, not a bug.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {subject} transition: {from} -> {to}")]
pub struct StateTransitionError {
    /// `"run"` or `"step"`
    pub subject: &'static str,
    pub from: String,
    pub to: String,
}

impl StateTransitionError {
    pub fn run(from: RunStatus, to: RunStatus) -> Self {
        Self {
            subject: "run",
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        }
    }

    pub fn step(from: StepStatus, to: StepStatus) -> Self {
        Self {
            subject: "step",
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        }
    }
}

/// Errors raised while validating a graph definition.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("duplicate node id: {0}")]
    DuplicateNodeId(String),

    #[error("edge references unknown node: {0}")]
    UnknownEdgeEndpoint(String),

    #[error("graph has no nodes")]
    Empty,
}
