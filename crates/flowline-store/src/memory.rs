//! In-memory reference implementation of the engine store.
//!
//! Deterministic and test-friendly. Production deployments should use
//! a transactional backend (see the `postgres` feature) for
//! source-of-truth data.

use crate::model::{QueryWindow, RunPatch, StepPatch, TraceRecord};
use crate::traits::{LogStore, RunStore, TraceStore, VersionStore};
use crate::{StoreError, StoreResult};
use async_trait::async_trait;
use chrono::Utc;
use flowline_types::{
    LogRecord, Run, RunId, RunStatus, RunStep, StepId, StepStatus, WorkflowId, WorkflowVersion,
    WorkflowVersionId,
};
use std::collections::HashMap;
use std::sync::RwLock;

/// In-memory engine store backed by `RwLock`ed maps.
#[derive(Default)]
pub struct InMemoryEngineStore {
    versions: RwLock<HashMap<WorkflowVersionId, WorkflowVersion>>,
    runs: RwLock<HashMap<RunId, Run>>,
    steps: RwLock<HashMap<RunId, Vec<RunStep>>>,
    logs: RwLock<Vec<LogRecord>>,
    traces: RwLock<HashMap<RunId, TraceRecord>>,
}

impl InMemoryEngineStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned(what: &str) -> StoreError {
    StoreError::Backend(format!("{what} lock poisoned"))
}

#[async_trait]
impl VersionStore for InMemoryEngineStore {
    async fn put_version(&self, version: WorkflowVersion) -> StoreResult<()> {
        let mut guard = self.versions.write().map_err(|_| poisoned("versions"))?;

        // One active version per workflow: activating this one
        // deactivates every sibling.
        if version.is_active {
            for sibling in guard
                .values_mut()
                .filter(|v| v.workflow_id == version.workflow_id)
            {
                sibling.is_active = false;
            }
        }

        guard.insert(version.id.clone(), version);
        Ok(())
    }

    async fn get_version(&self, id: &WorkflowVersionId) -> StoreResult<Option<WorkflowVersion>> {
        let guard = self.versions.read().map_err(|_| poisoned("versions"))?;
        Ok(guard.get(id).cloned())
    }

    async fn active_version(
        &self,
        workflow_id: &WorkflowId,
    ) -> StoreResult<Option<WorkflowVersion>> {
        let guard = self.versions.read().map_err(|_| poisoned("versions"))?;
        Ok(guard
            .values()
            .find(|v| &v.workflow_id == workflow_id && v.is_active)
            .cloned())
    }
}

#[async_trait]
impl RunStore for InMemoryEngineStore {
    async fn create_run_with_steps(&self, run: Run, steps: Vec<RunStep>) -> StoreResult<()> {
        // Both maps are locked before any write so the creation is
        // all-or-nothing from the perspective of other callers.
        let mut runs = self.runs.write().map_err(|_| poisoned("runs"))?;
        let mut step_map = self.steps.write().map_err(|_| poisoned("steps"))?;

        if runs.contains_key(&run.id) {
            return Err(StoreError::Conflict(format!(
                "run {} already exists",
                run.id
            )));
        }
        if let Some(key) = &run.idempotency_key {
            let duplicate = runs.values().any(|r| {
                r.workflow_version_id == run.workflow_version_id
                    && r.idempotency_key.as_deref() == Some(key.as_str())
            });
            if duplicate {
                return Err(StoreError::Conflict(format!(
                    "idempotency key {key} already used for version {}",
                    run.workflow_version_id
                )));
            }
        }

        step_map.insert(run.id.clone(), steps);
        runs.insert(run.id.clone(), run);
        Ok(())
    }

    async fn get_run(&self, id: &RunId) -> StoreResult<Option<Run>> {
        let guard = self.runs.read().map_err(|_| poisoned("runs"))?;
        Ok(guard.get(id).cloned())
    }

    async fn find_run_by_idempotency_key(
        &self,
        version_id: &WorkflowVersionId,
        key: &str,
    ) -> StoreResult<Option<Run>> {
        let guard = self.runs.read().map_err(|_| poisoned("runs"))?;
        Ok(guard
            .values()
            .find(|r| {
                &r.workflow_version_id == version_id && r.idempotency_key.as_deref() == Some(key)
            })
            .cloned())
    }

    async fn transition_run(
        &self,
        id: &RunId,
        expected_from: RunStatus,
        to: RunStatus,
        patch: RunPatch,
    ) -> StoreResult<Run> {
        let mut guard = self.runs.write().map_err(|_| poisoned("runs"))?;
        let run = guard
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("run {id} not found")))?;

        if run.status != expected_from {
            return Err(StoreError::InvariantViolation(format!(
                "run {id}: expected status {expected_from}, found {}",
                run.status
            )));
        }

        run.status = to;
        patch.apply(run);
        Ok(run.clone())
    }

    async fn update_run(&self, id: &RunId, patch: RunPatch) -> StoreResult<Run> {
        let mut guard = self.runs.write().map_err(|_| poisoned("runs"))?;
        let run = guard
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("run {id} not found")))?;
        patch.apply(run);
        Ok(run.clone())
    }

    async fn list_runs(
        &self,
        workflow_id: &WorkflowId,
        window: QueryWindow,
    ) -> StoreResult<Vec<Run>> {
        let guard = self.runs.read().map_err(|_| poisoned("runs"))?;
        let mut runs: Vec<Run> = guard
            .values()
            .filter(|r| &r.workflow_id == workflow_id)
            .cloned()
            .collect();
        // Newest first
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs
            .into_iter()
            .skip(window.offset)
            .take(window.limit)
            .collect())
    }

    async fn replays_of(&self, id: &RunId) -> StoreResult<Vec<Run>> {
        let guard = self.runs.read().map_err(|_| poisoned("runs"))?;
        let mut runs: Vec<Run> = guard
            .values()
            .filter(|r| r.replay.as_ref().map(|l| &l.replay_of) == Some(id))
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(runs)
    }

    async fn steps_for_run(&self, run_id: &RunId) -> StoreResult<Vec<RunStep>> {
        let guard = self.steps.read().map_err(|_| poisoned("steps"))?;
        let mut steps = guard.get(run_id).cloned().unwrap_or_default();
        steps.sort_by_key(|s| s.execution_order);
        Ok(steps)
    }

    async fn get_step(&self, run_id: &RunId, step_id: &StepId) -> StoreResult<Option<RunStep>> {
        let guard = self.steps.read().map_err(|_| poisoned("steps"))?;
        Ok(guard
            .get(run_id)
            .and_then(|steps| steps.iter().find(|s| &s.step_id == step_id))
            .cloned())
    }

    async fn transition_step(
        &self,
        run_id: &RunId,
        step_id: &StepId,
        expected_from: StepStatus,
        to: StepStatus,
        patch: StepPatch,
    ) -> StoreResult<RunStep> {
        let mut guard = self.steps.write().map_err(|_| poisoned("steps"))?;
        let step = guard
            .get_mut(run_id)
            .and_then(|steps| steps.iter_mut().find(|s| &s.step_id == step_id))
            .ok_or_else(|| StoreError::NotFound(format!("step {run_id}/{step_id} not found")))?;

        if step.status != expected_from {
            return Err(StoreError::InvariantViolation(format!(
                "step {run_id}/{step_id}: expected status {expected_from}, found {}",
                step.status
            )));
        }

        step.status = to;
        patch.apply(step);
        Ok(step.clone())
    }
}

#[async_trait]
impl LogStore for InMemoryEngineStore {
    async fn append_log(&self, record: LogRecord) -> StoreResult<()> {
        let mut guard = self.logs.write().map_err(|_| poisoned("logs"))?;
        guard.push(record);
        Ok(())
    }

    async fn logs_for_run(&self, run_id: &RunId) -> StoreResult<Vec<LogRecord>> {
        let guard = self.logs.read().map_err(|_| poisoned("logs"))?;
        Ok(guard
            .iter()
            .filter(|l| &l.run_id == run_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl TraceStore for InMemoryEngineStore {
    async fn upsert_trace(&self, record: TraceRecord) -> StoreResult<()> {
        let mut guard = self.traces.write().map_err(|_| poisoned("traces"))?;
        let mut record = record;
        record.updated_at = Utc::now();
        guard.insert(record.run_id.clone(), record);
        Ok(())
    }

    async fn get_trace(&self, run_id: &RunId) -> StoreResult<Option<TraceRecord>> {
        let guard = self.traces.read().map_err(|_| poisoned("traces"))?;
        Ok(guard.get(run_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_types::{GraphDefinition, GraphNode, JsonObject, TriggerType};

    fn make_version(workflow_id: &WorkflowId, version: u32, active: bool) -> WorkflowVersion {
        let graph = GraphDefinition::new(vec![GraphNode::new("s1", "http")], vec![]);
        let v = WorkflowVersion::new(workflow_id.clone(), version, graph);
        if active {
            v.activated()
        } else {
            v
        }
    }

    fn make_run(version: &WorkflowVersion) -> Run {
        Run::new(
            version.workflow_id.clone(),
            version.id.clone(),
            TriggerType::Webhook,
            JsonObject::new(),
        )
    }

    fn make_steps(run: &Run, version: &WorkflowVersion) -> Vec<RunStep> {
        version
            .graph
            .nodes
            .iter()
            .enumerate()
            .map(|(i, node)| RunStep::from_node(run.id.clone(), node, i as u32))
            .collect()
    }

    #[tokio::test]
    async fn activating_version_deactivates_siblings() {
        let store = InMemoryEngineStore::new();
        let workflow_id = WorkflowId::generate();

        let v1 = make_version(&workflow_id, 1, true);
        let v2 = make_version(&workflow_id, 2, true);
        let v1_id = v1.id.clone();
        let v2_id = v2.id.clone();

        store.put_version(v1).await.unwrap();
        store.put_version(v2).await.unwrap();

        assert!(!store.get_version(&v1_id).await.unwrap().unwrap().is_active);
        assert!(store.get_version(&v2_id).await.unwrap().unwrap().is_active);
        assert_eq!(
            store.active_version(&workflow_id).await.unwrap().unwrap().id,
            v2_id
        );
    }

    #[tokio::test]
    async fn create_run_with_steps_and_read_back() {
        let store = InMemoryEngineStore::new();
        let version = make_version(&WorkflowId::generate(), 1, true);
        let run = make_run(&version);
        let steps = make_steps(&run, &version);
        let run_id = run.id.clone();

        store.create_run_with_steps(run, steps).await.unwrap();

        assert!(store.get_run(&run_id).await.unwrap().is_some());
        assert_eq!(store.steps_for_run(&run_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_conflicts() {
        let store = InMemoryEngineStore::new();
        let version = make_version(&WorkflowId::generate(), 1, true);

        let run_a = make_run(&version).with_idempotency_key("k1");
        let steps_a = make_steps(&run_a, &version);
        store.create_run_with_steps(run_a, steps_a).await.unwrap();

        let run_b = make_run(&version).with_idempotency_key("k1");
        let steps_b = make_steps(&run_b, &version);
        let err = store.create_run_with_steps(run_b, steps_b).await;
        assert!(matches!(err, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn transition_run_enforces_expected_status() {
        let store = InMemoryEngineStore::new();
        let version = make_version(&WorkflowId::generate(), 1, true);
        let run = make_run(&version);
        let run_id = run.id.clone();
        store.create_run_with_steps(run, Vec::new()).await.unwrap();

        let updated = store
            .transition_run(
                &run_id,
                RunStatus::Pending,
                RunStatus::Running,
                RunPatch::started(Utc::now()),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, RunStatus::Running);
        assert!(updated.started_at.is_some());

        // Second identical transition loses the conditional check.
        let err = store
            .transition_run(
                &run_id,
                RunStatus::Pending,
                RunStatus::Running,
                RunPatch::default(),
            )
            .await;
        assert!(matches!(err, Err(StoreError::InvariantViolation(_))));
    }

    #[tokio::test]
    async fn transition_step_applies_patch() {
        let store = InMemoryEngineStore::new();
        let version = make_version(&WorkflowId::generate(), 1, true);
        let run = make_run(&version);
        let run_id = run.id.clone();
        let steps = make_steps(&run, &version);
        store.create_run_with_steps(run, steps).await.unwrap();

        let step_id = StepId::new("s1");
        store
            .transition_step(
                &run_id,
                &step_id,
                StepStatus::Pending,
                StepStatus::Running,
                StepPatch::started(Utc::now()),
            )
            .await
            .unwrap();

        let mut outputs = JsonObject::new();
        outputs.insert("n".into(), serde_json::json!(1));
        let step = store
            .transition_step(
                &run_id,
                &step_id,
                StepStatus::Running,
                StepStatus::Completed,
                StepPatch::finished(Utc::now()).with_outputs(outputs.clone()),
            )
            .await
            .unwrap();

        assert_eq!(step.status, StepStatus::Completed);
        assert_eq!(step.outputs, outputs);
    }

    #[tokio::test]
    async fn logs_filter_by_run() {
        let store = InMemoryEngineStore::new();
        let run_a = RunId::generate();
        let run_b = RunId::generate();

        store
            .append_log(LogRecord::new(
                run_a.clone(),
                flowline_types::LogLevel::Info,
                "a",
            ))
            .await
            .unwrap();
        store
            .append_log(LogRecord::new(
                run_b.clone(),
                flowline_types::LogLevel::Info,
                "b",
            ))
            .await
            .unwrap();

        let logs = store.logs_for_run(&run_a).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "a");
    }
}
