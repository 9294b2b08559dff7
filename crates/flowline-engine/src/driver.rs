//! Sequential run execution through the sandbox.

use crate::dispatch::RetryPolicy;
use crate::{EngineError, EngineResult, Orchestrator};
use flowline_sandbox::{SandboxError, SandboxExecutor};
use flowline_store::VersionStore;
use flowline_types::{
    ExecutionContext, GraphNode, JsonObject, Run, RunId, RunStatus, RunStep,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// Typed outcome of a failed step execution. Retry is decided from
/// this classification alone, never from inspecting error text.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StepFailure {
    /// Transient: retrying the same call could plausibly succeed.
    #[error("retryable step failure: {0}")]
    Retryable(String),
    /// Deterministic: retrying would fail the same way.
    #[error("fatal step failure: {0}")]
    Fatal(String),
}

impl From<&SandboxError> for StepFailure {
    fn from(e: &SandboxError) -> Self {
        if e.is_retryable() {
            Self::Retryable(e.to_string())
        } else {
            Self::Fatal(e.to_string())
        }
    }
}

impl StepFailure {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(m) | Self::Fatal(m) => m,
        }
    }
}

/// Drives one run from start to a terminal state, executing steps in
/// order through the sandbox.
pub struct RunDriver {
    orchestrator: Arc<Orchestrator>,
    sandbox: Arc<SandboxExecutor>,
    retry: RetryPolicy,
}

impl RunDriver {
    pub fn new(orchestrator: Arc<Orchestrator>, sandbox: Arc<SandboxExecutor>) -> Self {
        let config = orchestrator.config();
        let retry = RetryPolicy {
            max_retries: config.max_step_retries,
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
        };
        Self {
            orchestrator,
            sandbox,
            retry,
        }
    }

    /// Execute a pending run to a terminal state.
    ///
    /// The run status is re-read before every step, so a cancellation
    /// arriving between steps stops dispatch at the next boundary.
    pub async fn execute_run(&self, run_id: &RunId) -> EngineResult<Run> {
        let run = self.orchestrator.start_run(run_id).await?;
        info!(run_id = %run_id, workflow_id = %run.workflow_id, "run execution started");

        loop {
            let run = self.orchestrator.get_run(run_id).await?;
            if run.status != RunStatus::Running {
                info!(run_id = %run_id, status = %run.status, "run left running state, stopping dispatch");
                break;
            }

            let pending = self.orchestrator.get_next_steps(run_id).await?;
            let Some(step) = pending.into_iter().next() else {
                // All steps terminal without a completion signal from
                // this loop (e.g. every remaining step was skipped at
                // creation); close the run out explicitly.
                self.orchestrator.complete_run(run_id).await?;
                break;
            };

            let step = match self.orchestrator.execute_step(run_id, &step.step_id).await {
                Ok(step) => step,
                // Lost a dispatch race or the run was cancelled under
                // us; re-check the run status.
                Err(EngineError::Transition(e)) => {
                    warn!(run_id = %run_id, error = %e, "step claim rejected");
                    continue;
                }
                Err(e) => return Err(e),
            };

            match self.execute_step_with_retries(&run, &step).await {
                Ok(outputs) => {
                    self.orchestrator
                        .handle_step_completion(run_id, &step.step_id, outputs)
                        .await?;
                }
                Err(failure) => {
                    self.orchestrator
                        .handle_step_failure(run_id, &step.step_id, failure.message())
                        .await?;
                    break;
                }
            }
        }

        self.orchestrator.get_run(run_id).await
    }

    /// Run one step through the sandbox, retrying retryable failures
    /// with exponential backoff up to the configured ceiling.
    async fn execute_step_with_retries(
        &self,
        run: &Run,
        step: &RunStep,
    ) -> Result<JsonObject, StepFailure> {
        let node = self.graph_node(run, step).await?;
        let action_id = node
            .config
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or("default")
            .to_string();

        // Node-seeded inputs take precedence over the run input.
        let mut inputs = run.input.clone();
        for (key, value) in &step.inputs {
            inputs.insert(key.clone(), value.clone());
        }

        let ctx = ExecutionContext::for_run(run).for_step(step.step_id.clone());

        let mut attempt = 0;
        loop {
            let result = self
                .sandbox
                .execute_connector(&ctx, &step.step_type, &node.config, &action_id, &inputs)
                .await;

            match result {
                Ok((outputs, metrics)) => {
                    info!(
                        run_id = %run.id,
                        step_id = %step.step_id,
                        attempt,
                        duration_ms = metrics.duration_ms,
                        "step executed"
                    );
                    return Ok(outputs);
                }
                Err(e) => {
                    let failure = StepFailure::from(&e);
                    if failure.is_retryable() && attempt < self.retry.max_retries {
                        let delay = self.retry.delay_for(attempt);
                        warn!(
                            run_id = %run.id,
                            step_id = %step.step_id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "step failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(failure);
                }
            }
        }
    }

    async fn graph_node(&self, run: &Run, step: &RunStep) -> Result<GraphNode, StepFailure> {
        let version = self
            .orchestrator
            .store()
            .get_version(&run.workflow_version_id)
            .await
            .map_err(|e| StepFailure::Fatal(e.to_string()))?
            .ok_or_else(|| {
                StepFailure::Fatal(format!(
                    "workflow version {} not found",
                    run.workflow_version_id
                ))
            })?;
        version
            .graph
            .get_node(&step.step_id)
            .cloned()
            .ok_or_else(|| {
                StepFailure::Fatal(format!("graph node '{}' not found", step.step_id))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EngineConfig;
    use async_trait::async_trait;
    use flowline_sandbox::{
        ActionOutputs, ActionSpec, Connector, ConnectorError, ConnectorFactory,
        ConnectorManifest, ConnectorRegistry, NetworkPolicy,
    };
    use flowline_store::{InMemoryCounterStore, InMemoryEngineStore, RunStore};
    use flowline_types::{
        GraphDefinition, GraphNode, StepId, StepStatus, TriggerType, WorkflowId, WorkflowVersion,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Scripted connector: fails the first `fail_first` calls with a
    /// retryable error, then succeeds; `poison` makes it always fail.
    struct ScriptedConnector {
        manifest: ConnectorManifest,
        calls: Arc<AtomicUsize>,
        fail_first: usize,
        poison: bool,
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        fn manifest(&self) -> &ConnectorManifest {
            &self.manifest
        }

        async fn initialize(&mut self, _config: &JsonObject) -> Result<(), ConnectorError> {
            Ok(())
        }

        async fn execute(
            &self,
            _action_id: &str,
            _inputs: &JsonObject,
        ) -> Result<ActionOutputs, ConnectorError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.poison || call < self.fail_first {
                return Err(ConnectorError::Action("upstream unavailable".to_string()));
            }
            let mut outputs = ActionOutputs::new();
            outputs.insert("result".to_string(), json!("ok"));
            Ok(outputs)
        }
    }

    struct ScriptedFactory {
        kind: String,
        calls: Arc<AtomicUsize>,
        fail_first: usize,
        poison: bool,
    }

    impl ConnectorFactory for ScriptedFactory {
        fn kind(&self) -> &str {
            &self.kind
        }

        fn create(&self) -> Box<dyn Connector> {
            Box::new(ScriptedConnector {
                manifest: ConnectorManifest {
                    kind: self.kind.clone(),
                    name: self.kind.clone(),
                    actions: vec![ActionSpec {
                        id: "default".to_string(),
                        description: "scripted".to_string(),
                        input_keys: vec![],
                        output_keys: vec!["result".to_string()],
                    }],
                },
                calls: self.calls.clone(),
                fail_first: self.fail_first,
                poison: self.poison,
            })
        }
    }

    fn three_step_version(failing_kind: &str) -> WorkflowVersion {
        let graph = GraphDefinition::new(
            vec![
                GraphNode::new("s1", "good"),
                GraphNode::new("s2", failing_kind),
                GraphNode::new("s3", "good"),
            ],
            vec![],
        );
        WorkflowVersion::new(WorkflowId::generate(), 1, graph).activated()
    }

    struct Fixture {
        driver: RunDriver,
        orchestrator: Arc<Orchestrator>,
        calls: Arc<AtomicUsize>,
    }

    async fn make_fixture(version: &WorkflowVersion, fail_first: usize, poison: bool) -> Fixture {
        let store = Arc::new(InMemoryEngineStore::new());
        store.put_version(version.clone()).await.unwrap();

        let config = EngineConfig::default()
            .with_max_step_retries(2)
            .with_retry_base_delay(Duration::from_millis(1));
        let orchestrator = Arc::new(Orchestrator::new(
            store,
            Arc::new(InMemoryCounterStore::new()),
            config,
        ));

        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ConnectorRegistry::new();
        registry.register(Box::new(ScriptedFactory {
            kind: "good".to_string(),
            calls: Arc::new(AtomicUsize::new(0)),
            fail_first: 0,
            poison: false,
        }));
        registry.register(Box::new(ScriptedFactory {
            kind: "flaky".to_string(),
            calls: calls.clone(),
            fail_first,
            poison,
        }));

        let sandbox = Arc::new(
            SandboxExecutor::new(Arc::new(registry))
                .with_network_policy(NetworkPolicy::allow_all()),
        );
        Fixture {
            driver: RunDriver::new(orchestrator.clone(), sandbox),
            orchestrator,
            calls,
        }
    }

    #[tokio::test]
    async fn run_completes_when_all_steps_succeed() {
        let version = three_step_version("good");
        let fixture = make_fixture(&version, 0, false).await;

        let run = fixture
            .orchestrator
            .create_run(&version, TriggerType::Manual, JsonObject::new(), None, false)
            .await
            .unwrap();
        let finished = fixture.driver.execute_run(&run.id).await.unwrap();

        assert_eq!(finished.status, RunStatus::Completed);
        assert!(finished.output.contains_key("s1"));
        assert!(finished.output.contains_key("s3"));
    }

    #[tokio::test]
    async fn middle_step_failure_leaves_later_steps_pending() {
        let version = three_step_version("flaky");
        let fixture = make_fixture(&version, usize::MAX, true).await;

        let run = fixture
            .orchestrator
            .create_run(&version, TriggerType::Manual, JsonObject::new(), None, false)
            .await
            .unwrap();
        let finished = fixture.driver.execute_run(&run.id).await.unwrap();

        assert_eq!(finished.status, RunStatus::Failed);
        let steps = fixture
            .orchestrator
            .store()
            .steps_for_run(&run.id)
            .await
            .unwrap();
        assert_eq!(steps[0].status, StepStatus::Completed);
        assert_eq!(steps[1].status, StepStatus::Failed);
        assert_eq!(steps[2].status, StepStatus::Pending);
        // Initial attempt plus two retries.
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retryable_failure_recovers_within_budget() {
        let version = three_step_version("flaky");
        let fixture = make_fixture(&version, 2, false).await;

        let run = fixture
            .orchestrator
            .create_run(&version, TriggerType::Manual, JsonObject::new(), None, false)
            .await
            .unwrap();
        let finished = fixture.driver.execute_run(&run.id).await.unwrap();

        assert_eq!(finished.status, RunStatus::Completed);
        assert_eq!(fixture.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failure_classification_follows_sandbox_taxonomy() {
        let retryable = SandboxError::Connector(ConnectorError::Action("503".to_string()));
        assert_eq!(
            StepFailure::from(&retryable),
            StepFailure::Retryable("action failed: 503".to_string())
        );

        let fatal = SandboxError::resource_exceeded("memory", "over budget");
        assert!(matches!(StepFailure::from(&fatal), StepFailure::Fatal(_)));
    }
}
