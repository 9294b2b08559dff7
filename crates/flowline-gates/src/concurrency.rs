//! Per-workflow active-run counting.

use crate::{CounterStore, GateLimits, GateResult};
use flowline_types::{RunId, WorkflowId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Safety net against leaked slots: counters and markers expire after
/// this long even if a completion signal is lost.
const SLOT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Outcome of a concurrency check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConcurrencyDecision {
    pub allowed: bool,
    /// Active runs at the time of the check.
    pub active: u32,
    pub limit: u32,
}

/// Tracks how many runs of each workflow are currently active and
/// refuses admission past the configured ceiling.
///
/// Start and completion must be signalled explicitly; a per-run marker
/// makes completion tracking idempotent so a double signal (or one for
/// a run that was never started) cannot push the counter negative.
pub struct ConcurrencyGate {
    counters: Arc<dyn CounterStore>,
}

impl ConcurrencyGate {
    pub fn new(counters: Arc<dyn CounterStore>) -> Self {
        Self { counters }
    }

    fn count_key(workflow_id: &WorkflowId) -> String {
        format!("concurrency:{workflow_id}:count")
    }

    fn marker_key(workflow_id: &WorkflowId, run_id: &RunId) -> String {
        format!("concurrency:{workflow_id}:run:{run_id}")
    }

    /// Check whether another run of this workflow may start now.
    /// Read-only; does not reserve a slot.
    pub async fn can_start_run(
        &self,
        workflow_id: &WorkflowId,
        limits: &GateLimits,
    ) -> GateResult<ConcurrencyDecision> {
        let active = self.active_runs(workflow_id).await?;
        Ok(ConcurrencyDecision {
            allowed: active < limits.max_concurrent_runs,
            active,
            limit: limits.max_concurrent_runs,
        })
    }

    /// Record that a run has been admitted and occupies a slot.
    pub async fn track_run_start(
        &self,
        workflow_id: &WorkflowId,
        run_id: &RunId,
    ) -> GateResult<()> {
        self.counters
            .put_marker(&Self::marker_key(workflow_id, run_id), SLOT_TTL)
            .await?;
        let active = self
            .counters
            .increment(&Self::count_key(workflow_id), Some(SLOT_TTL))
            .await?;
        debug!(workflow_id = %workflow_id, run_id = %run_id, active, "run occupies concurrency slot");
        Ok(())
    }

    /// Record that a run reached a terminal state and frees its slot.
    /// Without a matching start marker this is a warned no-op.
    pub async fn track_run_completion(
        &self,
        workflow_id: &WorkflowId,
        run_id: &RunId,
    ) -> GateResult<()> {
        let had_marker = self
            .counters
            .take_marker(&Self::marker_key(workflow_id, run_id))
            .await?;
        if !had_marker {
            warn!(
                workflow_id = %workflow_id,
                run_id = %run_id,
                "completion signalled for a run with no active slot, ignoring"
            );
            return Ok(());
        }

        let active = self
            .counters
            .decrement_floor(&Self::count_key(workflow_id))
            .await?;
        debug!(workflow_id = %workflow_id, run_id = %run_id, active, "run released concurrency slot");
        Ok(())
    }

    /// Number of currently active runs for a workflow.
    pub async fn active_runs(&self, workflow_id: &WorkflowId) -> GateResult<u32> {
        let count = self.counters.get(&Self::count_key(workflow_id)).await?;
        Ok(u32::try_from(count).unwrap_or(0))
    }

    /// Administrative: drop all tracking state for a workflow.
    pub async fn reset(&self, workflow_id: &WorkflowId) -> GateResult<u64> {
        self.counters
            .clear_prefix(&format!("concurrency:{workflow_id}:"))
            .await
            .map_err(Into::into)
    }
}
