use crate::model::{QueryWindow, RunPatch, StepPatch, TraceRecord};
use crate::StoreResult;
use async_trait::async_trait;
use flowline_types::{
    LogRecord, Run, RunId, RunStatus, RunStep, StepId, StepStatus, WorkflowId, WorkflowVersion,
    WorkflowVersionId,
};

/// Storage interface for workflow versions. Versions are immutable
/// snapshots; the only mutation is the activation flag, and writing an
/// active version deactivates all siblings of the same workflow.
#[async_trait]
pub trait VersionStore: Send + Sync {
    async fn put_version(&self, version: WorkflowVersion) -> StoreResult<()>;

    async fn get_version(&self, id: &WorkflowVersionId) -> StoreResult<Option<WorkflowVersion>>;

    /// The single active version of a workflow, if any.
    async fn active_version(&self, workflow_id: &WorkflowId)
        -> StoreResult<Option<WorkflowVersion>>;
}

/// Storage interface for runs and their steps.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Persist a run together with all of its steps. Atomic: either
    /// the run and every step exist afterwards, or none do.
    async fn create_run_with_steps(&self, run: Run, steps: Vec<RunStep>) -> StoreResult<()>;

    async fn get_run(&self, id: &RunId) -> StoreResult<Option<Run>>;

    /// Idempotency lookup: at most one run exists per
    /// (version, idempotency key) pair.
    async fn find_run_by_idempotency_key(
        &self,
        version_id: &WorkflowVersionId,
        key: &str,
    ) -> StoreResult<Option<Run>>;

    /// Conditionally transition a run's status in a single-row update.
    /// Fails with `InvariantViolation` when the current status does
    /// not match `expected_from`; the patch applies only on success.
    async fn transition_run(
        &self,
        id: &RunId,
        expected_from: RunStatus,
        to: RunStatus,
        patch: RunPatch,
    ) -> StoreResult<Run>;

    /// Non-status patch (e.g. capturing the replay input snapshot).
    async fn update_run(&self, id: &RunId, patch: RunPatch) -> StoreResult<Run>;

    async fn list_runs(&self, workflow_id: &WorkflowId, window: QueryWindow)
        -> StoreResult<Vec<Run>>;

    /// Runs whose replay lineage points at the given run.
    async fn replays_of(&self, id: &RunId) -> StoreResult<Vec<Run>>;

    /// All steps of a run, ordered by execution order.
    async fn steps_for_run(&self, run_id: &RunId) -> StoreResult<Vec<RunStep>>;

    async fn get_step(&self, run_id: &RunId, step_id: &StepId) -> StoreResult<Option<RunStep>>;

    /// Conditional single-row step transition, mirroring
    /// [`RunStore::transition_run`].
    async fn transition_step(
        &self,
        run_id: &RunId,
        step_id: &StepId,
        expected_from: StepStatus,
        to: StepStatus,
        patch: StepPatch,
    ) -> StoreResult<RunStep>;
}

/// Storage interface for append-only log records.
#[async_trait]
pub trait LogStore: Send + Sync {
    async fn append_log(&self, record: LogRecord) -> StoreResult<()>;

    /// Log records for a run, oldest first.
    async fn logs_for_run(&self, run_id: &RunId) -> StoreResult<Vec<LogRecord>>;
}

/// Storage interface for derived trace records.
#[async_trait]
pub trait TraceStore: Send + Sync {
    async fn upsert_trace(&self, record: TraceRecord) -> StoreResult<()>;

    async fn get_trace(&self, run_id: &RunId) -> StoreResult<Option<TraceRecord>>;
}

/// Unified storage bundle used by the orchestration engine.
pub trait EngineStore: VersionStore + RunStore + LogStore + TraceStore + Send + Sync {}

impl<T> EngineStore for T where T: VersionStore + RunStore + LogStore + TraceStore + Send + Sync {}
