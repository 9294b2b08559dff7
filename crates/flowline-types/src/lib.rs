//! Flowline Domain Types
//!
//! The shared vocabulary of the run orchestration engine:
//!
//! - **WorkflowVersion**: an immutable snapshot of a workflow graph.
//!   Exactly one version per workflow is active at a time.
//! - **Run**: one execution instance of a version - admitted through
//!   the gates, advanced by the orchestrator, auditable end to end.
//! - **RunStep**: one execution instance of a single graph node
//!   within a run.
//! - **Lifecycle tables**: pure, static transition tables for run and
//!   step statuses. Every status mutation anywhere in the engine is
//!   checked against these tables first.
//! - **ExecutionContext**: correlation state passed by parameter
//!   through orchestrator → sandbox → trace. Never ambient.
//! - **RunTrace**: the derived, rebuildable execution trace.
//!
//! # Design Principles
//!
//! 1. Runs mutate only through lifecycle-validated transitions.
//! 2. Terminal states are final. No exceptions, no backdoors.
//! 3. Graph versions are read-only once created and safely shared
//!    across workers.

#![deny(unsafe_code)]

mod context;
mod errors;
mod graph;
mod ids;
mod lifecycle;
mod log;
mod run;
mod step;
mod trace;

pub use context::*;
pub use errors::*;
pub use graph::*;
pub use ids::*;
pub use lifecycle::*;
pub use log::*;
pub use run::*;
pub use step::*;
pub use trace::*;

/// JSON object payload used for run inputs/outputs and step data.
pub type JsonObject = serde_json::Map<String, serde_json::Value>;
