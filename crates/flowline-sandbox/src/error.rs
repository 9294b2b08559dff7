use crate::connector::ConnectorError;
use thiserror::Error;

/// Errors raised while executing a connector under sandbox policy.
///
/// The three classes stay distinguishable so the run driver can decide
/// between retrying and failing fast: only connector action errors are
/// retryable, policy and resource violations are deterministic.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("{policy} policy violation: {reason}")]
    PolicyViolation {
        policy: &'static str,
        reason: String,
    },

    #[error("resource limit exceeded ({resource}): {message}")]
    ResourceExceeded {
        resource: &'static str,
        message: String,
    },

    #[error(transparent)]
    Connector(#[from] ConnectorError),
}

impl SandboxError {
    pub fn network_violation(reason: impl Into<String>) -> Self {
        Self::PolicyViolation {
            policy: "network",
            reason: reason.into(),
        }
    }

    pub fn secret_violation(reason: impl Into<String>) -> Self {
        Self::PolicyViolation {
            policy: "secret",
            reason: reason.into(),
        }
    }

    pub fn resource_exceeded(resource: &'static str, message: impl Into<String>) -> Self {
        Self::ResourceExceeded {
            resource,
            message: message.into(),
        }
    }

    /// Whether retrying the same call could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connector(e) => e.is_retryable(),
            Self::PolicyViolation { .. } | Self::ResourceExceeded { .. } => false,
        }
    }
}

pub type SandboxResult<T> = Result<T, SandboxError>;
