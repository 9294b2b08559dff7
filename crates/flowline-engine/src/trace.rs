//! Derived execution traces.

use crate::{EngineError, EngineResult};
use flowline_store::{EngineStore, LogStore, RunStore, TraceRecord, TraceStore};
use flowline_types::{RunId, RunTrace, StepStatus, StepTrace, TraceSummary};
use std::sync::Arc;
use tracing::debug;

/// Builds queryable traces from persisted run, step and log records.
///
/// Traces are projections: building twice over the same records yields
/// structurally identical traces, and a lost trace is rebuilt rather
/// than recovered.
pub struct TraceAggregator {
    store: Arc<dyn EngineStore>,
}

impl TraceAggregator {
    pub fn new(store: Arc<dyn EngineStore>) -> Self {
        Self { store }
    }

    /// Assemble the trace for a run. Pure read; persists nothing.
    pub async fn build_trace(&self, run_id: &RunId) -> EngineResult<RunTrace> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))?;
        let steps = self.store.steps_for_run(run_id).await?;
        let logs = self.store.logs_for_run(run_id).await?;

        let mut summary = TraceSummary {
            total_steps: steps.len(),
            ..TraceSummary::default()
        };
        for log in &logs {
            summary.count_log(log.level);
        }

        let step_traces = steps
            .into_iter()
            .map(|step| {
                match step.status {
                    StepStatus::Completed => summary.completed_steps += 1,
                    StepStatus::Failed => summary.failed_steps += 1,
                    StepStatus::Skipped => summary.skipped_steps += 1,
                    StepStatus::Pending | StepStatus::Running => {}
                }

                let step_logs = logs
                    .iter()
                    .filter(|l| l.step_id.as_ref() == Some(&step.step_id))
                    .cloned()
                    .collect();

                StepTrace {
                    duration_ms: step.duration_ms(),
                    step_id: step.step_id,
                    step_type: step.step_type,
                    status: step.status,
                    started_at: step.started_at,
                    finished_at: step.finished_at,
                    error: step.error,
                    // Key names only; payload values stay out of traces.
                    input_keys: step.inputs.keys().cloned().collect(),
                    output_keys: step.outputs.keys().cloned().collect(),
                    logs: step_logs,
                }
            })
            .collect();

        Ok(RunTrace {
            run_id: run.id.clone(),
            status: run.status,
            trigger: run.trigger,
            created_at: run.created_at,
            started_at: run.started_at,
            finished_at: run.finished_at,
            duration_ms: run.duration_ms(),
            error: run.error,
            steps: step_traces,
            summary,
        })
    }

    /// Rebuild and persist the trace for a run.
    pub async fn update_trace(&self, run_id: &RunId) -> EngineResult<RunTrace> {
        let trace = self.build_trace(run_id).await?;
        self.store
            .upsert_trace(TraceRecord::new(trace.clone()))
            .await?;
        debug!(run_id = %run_id, steps = trace.steps.len(), "trace updated");
        Ok(trace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EngineConfig, Orchestrator};
    use flowline_store::{InMemoryCounterStore, InMemoryEngineStore, VersionStore};
    use flowline_types::{
        GraphDefinition, GraphNode, JsonObject, RunStatus, StepId, TriggerType, WorkflowId,
        WorkflowVersion,
    };
    use serde_json::json;

    async fn completed_run() -> (Arc<InMemoryEngineStore>, RunId) {
        let graph = GraphDefinition::new(
            vec![GraphNode::new("fetch", "http"), GraphNode::new("post", "chat")],
            vec![],
        );
        let version = WorkflowVersion::new(WorkflowId::generate(), 1, graph).activated();

        let store = Arc::new(InMemoryEngineStore::new());
        store.put_version(version.clone()).await.unwrap();
        let orchestrator = Orchestrator::new(
            store.clone(),
            Arc::new(InMemoryCounterStore::new()),
            EngineConfig::default(),
        );

        let run = orchestrator
            .create_run(&version, TriggerType::Cron, JsonObject::new(), None, false)
            .await
            .unwrap();
        orchestrator.start_run(&run.id).await.unwrap();
        for step_id in ["fetch", "post"] {
            let step_id = StepId::new(step_id);
            orchestrator.execute_step(&run.id, &step_id).await.unwrap();
            let mut outputs = JsonObject::new();
            outputs.insert("body".to_string(), json!("payload-value-42"));
            orchestrator
                .handle_step_completion(&run.id, &step_id, outputs)
                .await
                .unwrap();
        }
        (store, run.id)
    }

    #[tokio::test]
    async fn trace_summarizes_steps_and_logs() {
        let (store, run_id) = completed_run().await;
        let aggregator = TraceAggregator::new(store);

        let trace = aggregator.build_trace(&run_id).await.unwrap();
        assert_eq!(trace.status, RunStatus::Completed);
        assert_eq!(trace.steps.len(), 2);
        assert_eq!(trace.summary.total_steps, 2);
        assert_eq!(trace.summary.completed_steps, 2);
        assert_eq!(trace.summary.failed_steps, 0);
        assert!(trace.summary.total_logs > 0);
        assert_eq!(trace.steps[0].output_keys, vec!["body"]);
        // Step logs carry that step's audit records.
        assert!(!trace.steps[0].logs.is_empty());
    }

    #[tokio::test]
    async fn trace_carries_key_names_but_never_values() {
        let (store, run_id) = completed_run().await;
        let aggregator = TraceAggregator::new(store);

        let trace = aggregator.build_trace(&run_id).await.unwrap();
        let serialized = serde_json::to_string(&trace).unwrap();
        assert!(serialized.contains("body"));
        assert!(!serialized.contains("payload-value-42"));
    }

    #[tokio::test]
    async fn building_twice_yields_identical_traces() {
        let (store, run_id) = completed_run().await;
        let aggregator = TraceAggregator::new(store);

        let first = aggregator.build_trace(&run_id).await.unwrap();
        let second = aggregator.build_trace(&run_id).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn update_trace_persists_the_projection() {
        let (store, run_id) = completed_run().await;
        let aggregator = TraceAggregator::new(store.clone());

        let built = aggregator.update_trace(&run_id).await.unwrap();
        let stored = store.get_trace(&run_id).await.unwrap().unwrap();
        assert_eq!(stored.trace, built);

        // A second update replaces, never duplicates.
        aggregator.update_trace(&run_id).await.unwrap();
        let stored = store.get_trace(&run_id).await.unwrap().unwrap();
        assert_eq!(stored.trace, built);
    }
}
