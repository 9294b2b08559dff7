//! Flowline persistence contracts.
//!
//! This crate defines the storage seams of the orchestration engine:
//!
//! - run/step records with **conditional single-row transitions**
//!   (the store re-checks the expected from-status atomically, so
//!   concurrent workers racing on the same row degrade to a rejected
//!   transition, never corrupted state)
//! - read-only workflow versions (activation deactivates siblings)
//! - append-only log records and upsertable trace records
//! - a distributed counter store with atomic numeric operations,
//!   shared by both admission gates
//!
//! Design stance:
//! - The transactional backend (PostgreSQL) is the source of truth.
//! - The in-memory adapter is deterministic and test-friendly.
//! - Traces are projections; they can always be rebuilt.

#![deny(unsafe_code)]

mod counter;
mod error;
mod memory;
mod model;
#[cfg(feature = "postgres")]
pub mod postgres;
mod traits;

pub use counter::{CounterStore, InMemoryCounterStore};
pub use error::{StoreError, StoreResult};
pub use memory::InMemoryEngineStore;
pub use model::{QueryWindow, RunPatch, StepPatch, TraceRecord};
pub use traits::{EngineStore, LogStore, RunStore, TraceStore, VersionStore};
