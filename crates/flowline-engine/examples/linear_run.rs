//! Local end-to-end demo: three-step workflow run to completion with
//! an in-memory store and a fake connector.
//!
//! ```sh
//! cargo run -p flowline-engine --example linear_run
//! ```

use async_trait::async_trait;
use flowline_engine::{EngineConfig, Orchestrator, RunDriver, TraceAggregator};
use flowline_sandbox::{
    ActionOutputs, ActionSpec, Connector, ConnectorError, ConnectorFactory, ConnectorManifest,
    ConnectorRegistry, NetworkPolicy, SandboxExecutor,
};
use flowline_store::{InMemoryCounterStore, InMemoryEngineStore, VersionStore};
use flowline_types::{
    GraphDefinition, GraphEdge, GraphNode, JsonObject, TriggerType, WorkflowId, WorkflowVersion,
};
use serde_json::json;
use std::sync::Arc;

struct EchoConnector {
    manifest: ConnectorManifest,
}

#[async_trait]
impl Connector for EchoConnector {
    fn manifest(&self) -> &ConnectorManifest {
        &self.manifest
    }

    async fn initialize(&mut self, _config: &JsonObject) -> Result<(), ConnectorError> {
        Ok(())
    }

    async fn execute(
        &self,
        action_id: &str,
        inputs: &JsonObject,
    ) -> Result<ActionOutputs, ConnectorError> {
        let mut outputs = ActionOutputs::new();
        outputs.insert("action".to_string(), json!(action_id));
        outputs.insert("echoed".to_string(), json!(inputs.len()));
        Ok(outputs)
    }
}

struct EchoFactory;

impl ConnectorFactory for EchoFactory {
    fn kind(&self) -> &str {
        "echo"
    }

    fn create(&self) -> Box<dyn Connector> {
        Box::new(EchoConnector {
            manifest: ConnectorManifest {
                kind: "echo".to_string(),
                name: "Echo".to_string(),
                actions: vec![ActionSpec {
                    id: "default".to_string(),
                    description: "Echoes its inputs".to_string(),
                    input_keys: vec![],
                    output_keys: vec!["action".to_string(), "echoed".to_string()],
                }],
            },
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let store = Arc::new(InMemoryEngineStore::new());
    let counters = Arc::new(InMemoryCounterStore::new());

    let mut registry = ConnectorRegistry::new();
    registry.register(Box::new(EchoFactory));
    let registry = Arc::new(registry);
    registry.init().await;

    let graph = GraphDefinition::new(
        vec![
            GraphNode::new("fetch", "echo")
                .with_config_entry("inputs", json!({"source": "demo-feed"})),
            GraphNode::new("transform", "echo"),
            GraphNode::new("deliver", "echo"),
        ],
        vec![
            GraphEdge::new("fetch", "transform"),
            GraphEdge::new("transform", "deliver"),
        ],
    );
    let version = WorkflowVersion::new(WorkflowId::generate(), 1, graph).activated();
    store.put_version(version.clone()).await?;

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        counters,
        EngineConfig::default(),
    ));
    let sandbox = Arc::new(
        SandboxExecutor::new(registry.clone()).with_network_policy(NetworkPolicy::allow_all()),
    );
    let driver = RunDriver::new(orchestrator.clone(), sandbox);

    let mut input = JsonObject::new();
    input.insert("requested_by".to_string(), json!("demo"));
    let run = orchestrator
        .create_run(&version, TriggerType::Manual, input, None, true)
        .await?;
    let finished = driver.execute_run(&run.id).await?;
    println!("run {} finished: {}", finished.id, finished.status);

    let aggregator = TraceAggregator::new(store);
    let trace = aggregator.update_trace(&run.id).await?;
    println!(
        "trace: {} steps, {} completed, {} logs",
        trace.summary.total_steps, trace.summary.completed_steps, trace.summary.total_logs
    );
    for step in &trace.steps {
        println!(
            "  {} [{}] {} ({} ms)",
            step.step_id,
            step.step_type,
            step.status,
            step.duration_ms.unwrap_or_default()
        );
    }

    registry.shutdown().await;
    Ok(())
}
