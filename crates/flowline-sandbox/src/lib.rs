//! Sandboxed connector execution.
//!
//! Connectors are the only place the engine touches the outside world,
//! so every execution passes through this crate's guardrails:
//!
//! - **network policy** checked over config and inputs before the
//!   connector runs; a violation aborts the call outright
//! - **secret policy** restricting which credential references a step
//!   may use, with masking for anything that reaches a log
//! - **resource limits** enforced by a pluggable [`ResourceLimiter`],
//!   either advisory (in-process watchdog plus sampling) or
//!   process-level (pid supervision with force-kill)
//! - **execution monitoring** producing serializable metrics for both
//!   success and failure paths
//!
//! Connector registration is explicit and dependency-injected; the
//! process entry point owns the registry's init/shutdown lifecycle.

#![deny(unsafe_code)]

mod connector;
mod error;
mod executor;
mod limiter;
mod limits;
mod monitor;
mod policy;

pub use connector::{
    ActionOutputs, ActionSpec, Connector, ConnectorError, ConnectorFactory, ConnectorManifest,
    ConnectorRegistry,
};
pub use error::{SandboxError, SandboxResult};
pub use executor::SandboxExecutor;
pub use limiter::{AdvisoryLimiter, ProcessLimiter, ResourceLimiter};
pub use limits::{ResourceLimits, ResourceUsage};
pub use monitor::{ExecutionMetrics, ExecutionMonitor, RecordedError};
pub use policy::{mask_secret, NetworkPolicy, SecretPolicy};
