//! Run and step lifecycle coordination.
//!
//! The orchestrator owns every status mutation in the system. Each one
//! follows the same shape: consult the lifecycle table, then ask the
//! store for a conditional single-row transition, then emit an audit
//! event. Concurrent workers racing on the same run or step degrade to
//! a rejected transition on the slower side; persisted state never
//! tears.

use crate::{EngineConfig, EngineError, EngineResult};
use chrono::Utc;
use flowline_gates::{ConcurrencyGate, RateGate};
use flowline_store::{
    CounterStore, EngineStore, LogStore, RunPatch, RunStore, StepPatch, StoreError, VersionStore,
};
use flowline_types::{
    JsonObject, LogLevel, LogRecord, Run, RunId, RunLifecycle, RunStatus, RunStep,
    StateTransitionError, StepId, StepLifecycle, StepStatus, TriggerType, WorkflowVersion,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

pub struct Orchestrator {
    store: Arc<dyn EngineStore>,
    concurrency: ConcurrencyGate,
    rate: RateGate,
    config: EngineConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn EngineStore>,
        counters: Arc<dyn CounterStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            concurrency: ConcurrencyGate::new(counters.clone()),
            rate: RateGate::new(counters),
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn EngineStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Run admission ────────────────────────────────────────────────

    /// Admit and persist a new run of a workflow version.
    ///
    /// With an idempotency key, a repeat call returns the existing run
    /// without side effects. With `check_limits`, the rate gate is
    /// consulted before the concurrency gate, and a rejection by either
    /// leaves nothing persisted and nothing recorded.
    pub async fn create_run(
        &self,
        version: &WorkflowVersion,
        trigger: TriggerType,
        input: JsonObject,
        idempotency_key: Option<String>,
        check_limits: bool,
    ) -> EngineResult<Run> {
        if let Some(key) = &idempotency_key {
            if let Some(existing) = self
                .store
                .find_run_by_idempotency_key(&version.id, key)
                .await?
            {
                info!(
                    run_id = %existing.id,
                    idempotency_key = %key,
                    "idempotency key hit, returning existing run"
                );
                return Ok(existing);
            }
        }

        version.graph.validate()?;

        if check_limits {
            let rate = self
                .rate
                .check_rate_limit(&version.workflow_id, &self.config.gate_limits)
                .await?;
            if !rate.allowed {
                return Err(EngineError::RateLimitExceeded {
                    workflow_id: version.workflow_id.to_string(),
                    limit: rate.limit,
                });
            }

            let concurrency = self
                .concurrency
                .can_start_run(&version.workflow_id, &self.config.gate_limits)
                .await?;
            if !concurrency.allowed {
                return Err(EngineError::ConcurrencyLimitExceeded {
                    workflow_id: version.workflow_id.to_string(),
                    limit: concurrency.limit,
                });
            }
        }

        let mut run = Run::new(
            version.workflow_id.clone(),
            version.id.clone(),
            trigger,
            input,
        );
        if let Some(key) = idempotency_key.clone() {
            run = run.with_idempotency_key(key);
        }

        let steps: Vec<RunStep> = version
            .graph
            .nodes
            .iter()
            .enumerate()
            .map(|(order, node)| RunStep::from_node(run.id.clone(), node, order as u32))
            .collect();

        match self
            .store
            .create_run_with_steps(run.clone(), steps.clone())
            .await
        {
            Ok(()) => {}
            // Two concurrent calls with the same key can both miss the
            // lookup; the loser of the insert race re-reads the winner.
            Err(StoreError::Conflict(_)) if idempotency_key.is_some() => {
                if let Some(existing) = self
                    .store
                    .find_run_by_idempotency_key(&version.id, idempotency_key.as_deref().unwrap_or_default())
                    .await?
                {
                    return Ok(existing);
                }
                return Err(EngineError::Store(StoreError::Conflict(format!(
                    "run creation conflict for version {}",
                    version.id
                ))));
            }
            Err(e) => return Err(e.into()),
        }

        if check_limits {
            self.rate.record_run(&version.workflow_id).await?;
        }

        info!(
            run_id = %run.id,
            workflow_id = %run.workflow_id,
            version_id = %run.workflow_version_id,
            trigger = %trigger,
            steps = steps.len(),
            "run created"
        );
        self.audit(&run.id, None, "run", "created", run.status.as_str(), None)
            .await;

        Ok(run)
    }

    // ── Run transitions ──────────────────────────────────────────────

    /// Move a pending run to running and claim its concurrency slot.
    pub async fn start_run(&self, run_id: &RunId) -> EngineResult<Run> {
        let run = self.get_run(run_id).await?;
        RunLifecycle::check(run.status, RunStatus::Running)?;

        let run = self
            .store
            .transition_run(
                run_id,
                RunStatus::Pending,
                RunStatus::Running,
                RunPatch::started(Utc::now()),
            )
            .await?;
        self.concurrency
            .track_run_start(&run.workflow_id, run_id)
            .await?;

        self.audit(run_id, None, "run", "pending", "running", None).await;
        Ok(run)
    }

    /// Complete a running run: aggregate completed step outputs into
    /// the run output and release the concurrency slot.
    pub async fn complete_run(&self, run_id: &RunId) -> EngineResult<Run> {
        let run = self.get_run(run_id).await?;
        RunLifecycle::check(run.status, RunStatus::Completed)?;

        let steps = self.store.steps_for_run(run_id).await?;
        let mut output = JsonObject::new();
        for step in &steps {
            if step.status == StepStatus::Completed {
                output.insert(
                    step.step_id.to_string(),
                    Value::Object(step.outputs.clone()),
                );
            }
        }

        let run = self
            .store
            .transition_run(
                run_id,
                RunStatus::Running,
                RunStatus::Completed,
                RunPatch::finished(Utc::now()).with_output(output),
            )
            .await?;
        self.concurrency
            .track_run_completion(&run.workflow_id, run_id)
            .await?;

        info!(run_id = %run_id, duration_ms = ?run.duration_ms(), "run completed");
        self.audit(run_id, None, "run", "running", "completed", None).await;
        Ok(run)
    }

    /// Fail a running run. A no-op on runs that are already terminal,
    /// so late failure signals after completion or cancellation are
    /// absorbed silently.
    pub async fn fail_run(&self, run_id: &RunId, error: impl Into<String>) -> EngineResult<Run> {
        let run = self.get_run(run_id).await?;
        if run.is_terminal() {
            return Ok(run);
        }
        RunLifecycle::check(run.status, RunStatus::Failed)?;

        let error = error.into();
        let run = self
            .store
            .transition_run(
                run_id,
                RunStatus::Running,
                RunStatus::Failed,
                RunPatch::finished(Utc::now()).with_error(error.clone()),
            )
            .await?;
        self.concurrency
            .track_run_completion(&run.workflow_id, run_id)
            .await?;

        warn!(run_id = %run_id, error = %error, "run failed");
        self.audit(
            run_id,
            None,
            "run",
            "running",
            "failed",
            Some(json!({ "error": error })),
        )
        .await;
        Ok(run)
    }

    /// Cancel a pending or running run. Pending runs never claimed a
    /// concurrency slot, so only started runs release one.
    pub async fn cancel_run(&self, run_id: &RunId) -> EngineResult<Run> {
        let run = self.get_run(run_id).await?;
        RunLifecycle::check(run.status, RunStatus::Cancelled)?;
        let from = run.status;

        let run = self
            .store
            .transition_run(
                run_id,
                from,
                RunStatus::Cancelled,
                RunPatch::finished(Utc::now()),
            )
            .await?;
        if from == RunStatus::Running {
            self.concurrency
                .track_run_completion(&run.workflow_id, run_id)
                .await?;
        }

        info!(run_id = %run_id, from = %from, "run cancelled");
        self.audit(run_id, None, "run", from.as_str(), "cancelled", None).await;
        Ok(run)
    }

    // ── Step transitions ─────────────────────────────────────────────

    /// Claim a pending step for execution. Refused when the run is not
    /// running, which is how cancellation stops further dispatch.
    pub async fn execute_step(&self, run_id: &RunId, step_id: &StepId) -> EngineResult<RunStep> {
        let run = self.get_run(run_id).await?;
        if run.status != RunStatus::Running {
            return Err(StateTransitionError::run(run.status, RunStatus::Running).into());
        }

        let step = self.get_step(run_id, step_id).await?;
        StepLifecycle::check(step.status, StepStatus::Running)?;

        let step = self
            .store
            .transition_step(
                run_id,
                step_id,
                StepStatus::Pending,
                StepStatus::Running,
                StepPatch::started(Utc::now()),
            )
            .await?;

        self.audit(run_id, Some(step_id), "step", "pending", "running", None)
            .await;
        Ok(step)
    }

    /// Record a step's successful outputs, then complete the run if it
    /// was the last one outstanding.
    pub async fn handle_step_completion(
        &self,
        run_id: &RunId,
        step_id: &StepId,
        outputs: JsonObject,
    ) -> EngineResult<RunStep> {
        let step = self.get_step(run_id, step_id).await?;
        StepLifecycle::check(step.status, StepStatus::Completed)?;

        self.validate_outputs(run_id, step_id, &outputs).await?;

        let step = self
            .store
            .transition_step(
                run_id,
                step_id,
                StepStatus::Running,
                StepStatus::Completed,
                StepPatch::finished(Utc::now()).with_outputs(outputs),
            )
            .await?;

        self.audit(run_id, Some(step_id), "step", "running", "completed", None)
            .await;

        let steps = self.store.steps_for_run(run_id).await?;
        let all_done = steps.iter().all(|s| {
            matches!(s.status, StepStatus::Completed | StepStatus::Skipped)
        });
        if all_done {
            self.complete_run(run_id).await?;
        }

        Ok(step)
    }

    /// Record a step failure and fail the whole run. One failed step
    /// fails the run; there is no partial-success terminal state.
    pub async fn handle_step_failure(
        &self,
        run_id: &RunId,
        step_id: &StepId,
        error: impl Into<String>,
    ) -> EngineResult<RunStep> {
        let step = self.get_step(run_id, step_id).await?;
        StepLifecycle::check(step.status, StepStatus::Failed)?;

        let error = error.into();
        let step = self
            .store
            .transition_step(
                run_id,
                step_id,
                StepStatus::Running,
                StepStatus::Failed,
                StepPatch::finished(Utc::now()).with_error(error.clone()),
            )
            .await?;

        self.audit(
            run_id,
            Some(step_id),
            "step",
            "running",
            "failed",
            Some(json!({ "error": error })),
        )
        .await;

        self.fail_run(run_id, format!("step '{step_id}' failed: {error}"))
            .await?;
        Ok(step)
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub async fn get_run(&self, run_id: &RunId) -> EngineResult<Run> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))
    }

    pub async fn get_step(&self, run_id: &RunId, step_id: &StepId) -> EngineResult<RunStep> {
        self.store
            .get_step(run_id, step_id)
            .await?
            .ok_or_else(|| EngineError::StepNotFound(format!("{run_id}/{step_id}")))
    }

    /// Pending steps of a run, in persisted execution order.
    ///
    /// TODO: resolve readiness from graph edges instead of declaration
    /// order, so independent branches can be offered in parallel.
    pub async fn get_next_steps(&self, run_id: &RunId) -> EngineResult<Vec<RunStep>> {
        let steps = self.store.steps_for_run(run_id).await?;
        Ok(steps
            .into_iter()
            .filter(|s| s.status == StepStatus::Pending)
            .collect())
    }

    // ── Internals ────────────────────────────────────────────────────

    /// Best-effort check of produced outputs against the node's
    /// declared output keys. Missing keys are logged, never fatal.
    async fn validate_outputs(
        &self,
        run_id: &RunId,
        step_id: &StepId,
        outputs: &JsonObject,
    ) -> EngineResult<()> {
        let run = self.get_run(run_id).await?;
        let Some(version) = self.store.get_version(&run.workflow_version_id).await? else {
            return Ok(());
        };
        let Some(node) = version.graph.get_node(step_id) else {
            return Ok(());
        };

        let missing: Vec<String> = node
            .declared_output_keys()
            .into_iter()
            .filter(|key| !outputs.contains_key(key))
            .collect();
        if !missing.is_empty() {
            warn!(
                run_id = %run_id,
                step_id = %step_id,
                missing = ?missing,
                "step outputs are missing declared keys"
            );
            let record = LogRecord::new(
                run_id.clone(),
                LogLevel::Warn,
                "step outputs missing declared keys",
            )
            .with_step(step_id.clone())
            .with_field("missing_keys", json!(missing));
            if let Err(e) = self.store.append_log(record).await {
                warn!(run_id = %run_id, error = %e, "failed to append validation log");
            }
        }
        Ok(())
    }

    /// Emit one audit event for an accepted transition, both as a
    /// tracing event and as a persisted log record.
    async fn audit(
        &self,
        run_id: &RunId,
        step_id: Option<&StepId>,
        subject: &'static str,
        from: &str,
        to: &str,
        metadata: Option<Value>,
    ) {
        info!(
            run_id = %run_id,
            step_id = step_id.map(|s| s.as_str()).unwrap_or("-"),
            subject,
            from,
            to,
            "state transition"
        );

        let mut record = LogRecord::new(
            run_id.clone(),
            LogLevel::Info,
            format!("{subject} transition: {from} -> {to}"),
        )
        .with_field("subject", json!(subject))
        .with_field("from", json!(from))
        .with_field("to", json!(to));
        if let Some(step_id) = step_id {
            record = record.with_step(step_id.clone());
        }
        if let Some(metadata) = metadata {
            record = record.with_field("metadata", metadata);
        }

        if let Err(e) = self.store.append_log(record).await {
            warn!(run_id = %run_id, error = %e, "failed to append audit log");
        }
    }
}
