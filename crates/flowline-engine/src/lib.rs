//! The Flowline run orchestration engine.
//!
//! Coordinates the full life of a workflow run:
//!
//! - [`Orchestrator`] - run/step lifecycle transitions, admission
//!   through the rate and concurrency gates, audit logging
//! - [`RunDriver`] - sequential step execution through the sandbox,
//!   with typed retry classification and backoff
//! - [`TaskDispatcher`] / [`LocalTaskDispatcher`] - the work handoff
//!   seam between admission and execution
//! - [`ReplayService`] - full and partial re-execution of past runs
//! - [`TraceAggregator`] - derived, rebuildable execution traces
//!
//! All state lives behind the [`flowline_store`] traits; the engine
//! holds no authoritative state of its own, so any number of engine
//! processes can share one backing store.

#![deny(unsafe_code)]

mod config;
mod dispatch;
mod driver;
mod errors;
mod orchestrator;
mod replay;
mod trace;

pub use config::EngineConfig;
pub use dispatch::{LocalTaskDispatcher, RetryPolicy, TaskDispatcher, WorkItem};
pub use driver::{RunDriver, StepFailure};
pub use errors::{EngineError, EngineResult};
pub use orchestrator::Orchestrator;
pub use replay::{ReplayService, ReplayStage};
pub use trace::TraceAggregator;
