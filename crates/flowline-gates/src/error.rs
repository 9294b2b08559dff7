use flowline_store::StoreError;
use thiserror::Error;

/// Errors surfaced by the admission gates.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("counter store error: {0}")]
    Store(#[from] StoreError),
}

pub type GateResult<T> = Result<T, GateError>;
