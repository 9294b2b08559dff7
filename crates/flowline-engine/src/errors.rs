use flowline_gates::GateError;
use flowline_sandbox::SandboxError;
use flowline_store::StoreError;
use flowline_types::{GraphError, StateTransitionError};
use thiserror::Error;

/// Engine-level errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Transition(#[from] StateTransitionError),

    #[error("rate limit exceeded for workflow {workflow_id}: {limit} runs per minute")]
    RateLimitExceeded { workflow_id: String, limit: u32 },

    #[error("concurrency limit exceeded for workflow {workflow_id}: {limit} active runs")]
    ConcurrencyLimitExceeded { workflow_id: String, limit: u32 },

    #[error("replay not possible: {0}")]
    Replay(String),

    #[error("workflow version not found: {0}")]
    VersionNotFound(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("step not found: {0}")]
    StepNotFound(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

impl From<GateError> for EngineError {
    fn from(e: GateError) -> Self {
        match e {
            GateError::Store(inner) => Self::Store(inner),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
