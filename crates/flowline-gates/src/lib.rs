//! Admission gates for run creation.
//!
//! Two independent checks guard every run admission: a rate gate
//! (fixed one-minute buckets per workflow) and a concurrency gate
//! (active-run counter per workflow). Both are thin layers over the
//! shared [`CounterStore`], so a multi-process deployment pointing the
//! gates at the same backing store gets cluster-wide enforcement for
//! free.
//!
//! Admission order is rate first, then concurrency: a rate rejection
//! must not consume a concurrency slot.

#![deny(unsafe_code)]

mod concurrency;
mod error;
mod limits;
mod rate;

pub use concurrency::{ConcurrencyDecision, ConcurrencyGate};
pub use error::{GateError, GateResult};
pub use limits::GateLimits;
pub use rate::{RateDecision, RateGate};

pub(crate) use flowline_store::CounterStore;
