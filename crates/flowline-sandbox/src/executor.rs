//! Policy-checked connector execution.

use crate::connector::{ActionOutputs, ConnectorError, ConnectorRegistry};
use crate::error::{SandboxError, SandboxResult};
use crate::limiter::{AdvisoryLimiter, ResourceLimiter};
use crate::limits::ResourceLimits;
use crate::monitor::{ExecutionMetrics, ExecutionMonitor};
use crate::policy::{NetworkPolicy, SecretPolicy};
use flowline_types::{ExecutionContext, JsonObject};
use futures::FutureExt;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// Config keys holding credential references.
const CREDENTIAL_ID_KEY: &str = "credential_id";
const CREDENTIALS_KEY: &str = "credentials";

/// Runs connector actions under network, secret and resource policy.
pub struct SandboxExecutor {
    network: NetworkPolicy,
    secrets: SecretPolicy,
    limits: ResourceLimits,
    limiter: Arc<dyn ResourceLimiter>,
    registry: Arc<ConnectorRegistry>,
}

impl SandboxExecutor {
    /// Executor with default limits, a permissive secret policy, an
    /// egress policy that refuses localhost and private addresses, and
    /// advisory limit enforcement.
    pub fn new(registry: Arc<ConnectorRegistry>) -> Self {
        Self {
            network: NetworkPolicy::default(),
            secrets: SecretPolicy::default(),
            limits: ResourceLimits::default(),
            limiter: Arc::new(AdvisoryLimiter::default()),
            registry,
        }
    }

    pub fn with_network_policy(mut self, policy: NetworkPolicy) -> Self {
        self.network = policy;
        self
    }

    pub fn with_secret_policy(mut self, policy: SecretPolicy) -> Self {
        self.secrets = policy;
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_limiter(mut self, limiter: Arc<dyn ResourceLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Execute one connector action for a step.
    ///
    /// Policy checks run first and abort the call before any connector
    /// code executes. The connector is then created fresh, initialized
    /// with the step config and driven under the resource limiter.
    pub async fn execute_connector(
        &self,
        ctx: &ExecutionContext,
        kind: &str,
        config: &JsonObject,
        action_id: &str,
        inputs: &JsonObject,
    ) -> SandboxResult<(ActionOutputs, ExecutionMetrics)> {
        self.check_credentials(config)?;
        self.network.scan_object(config)?;
        self.network.scan_object(inputs)?;

        let factory = self.registry.factory(kind).ok_or_else(|| {
            SandboxError::Connector(ConnectorError::Initialization(format!(
                "no connector registered for kind '{kind}'"
            )))
        })?;

        let mut connector = factory.create();
        connector.initialize(config).await?;

        let mut monitor = ExecutionMonitor::start();
        let work = connector.execute(action_id, inputs).boxed();
        let result = self
            .limiter
            .supervise(&self.limits, &mut monitor, work)
            .await;

        let outputs = match result {
            Ok(outputs) => outputs,
            Err(e) => {
                if let SandboxError::Connector(inner) = &e {
                    monitor.record_error("connector", inner.to_string());
                }
                let metrics = monitor.finish();
                warn!(
                    run_id = %ctx.run_id,
                    connector = kind,
                    action = action_id,
                    duration_ms = metrics.duration_ms,
                    error = %e,
                    "connector execution failed"
                );
                return Err(e);
            }
        };

        let serialized = serde_json::to_vec(&Value::Object(outputs.clone()))
            .map_err(|e| SandboxError::Connector(ConnectorError::Action(e.to_string())))?;
        if serialized.len() as u64 > self.limits.max_output_bytes {
            let metrics = monitor.finish();
            warn!(
                run_id = %ctx.run_id,
                connector = kind,
                action = action_id,
                output_bytes = serialized.len(),
                duration_ms = metrics.duration_ms,
                "connector output exceeds size budget"
            );
            return Err(SandboxError::resource_exceeded(
                "output",
                format!(
                    "{} bytes produced, budget {}",
                    serialized.len(),
                    self.limits.max_output_bytes
                ),
            ));
        }

        let metrics = monitor.finish();
        info!(
            run_id = %ctx.run_id,
            connector = kind,
            action = action_id,
            duration_ms = metrics.duration_ms,
            "connector execution completed"
        );
        Ok((outputs, metrics))
    }

    /// Check every credential reference in the step config against the
    /// secret policy. References appear either as a single
    /// `credential_id` string or a `credentials` list.
    fn check_credentials(&self, config: &JsonObject) -> SandboxResult<()> {
        if let Some(Value::String(id)) = config.get(CREDENTIAL_ID_KEY) {
            self.secrets.check_credential(id)?;
        }
        if let Some(Value::Array(ids)) = config.get(CREDENTIALS_KEY) {
            for entry in ids {
                if let Value::String(id) = entry {
                    self.secrets.check_credential(id)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{ActionSpec, Connector, ConnectorFactory, ConnectorManifest};
    use async_trait::async_trait;
    use flowline_types::{Run, StepId, TriggerType, WorkflowId, WorkflowVersionId};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingConnector {
        manifest: ConnectorManifest,
        calls: Arc<AtomicUsize>,
        payload: String,
    }

    #[async_trait]
    impl Connector for CountingConnector {
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
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut outputs = ActionOutputs::new();
            outputs.insert("body".to_string(), json!(self.payload));
            Ok(outputs)
        }
    }

    struct CountingFactory {
        calls: Arc<AtomicUsize>,
        payload: String,
    }

    impl ConnectorFactory for CountingFactory {
        fn kind(&self) -> &str {
            "http"
        }

        fn create(&self) -> Box<dyn Connector> {
            Box::new(CountingConnector {
                manifest: ConnectorManifest {
                    kind: "http".to_string(),
                    name: "HTTP".to_string(),
                    actions: vec![ActionSpec {
                        id: "get".to_string(),
                        description: "Fetch a URL".to_string(),
                        input_keys: vec![],
                        output_keys: vec!["body".to_string()],
                    }],
                },
                calls: self.calls.clone(),
                payload: self.payload.clone(),
            })
        }
    }

    fn make_ctx() -> ExecutionContext {
        let run = Run::new(
            WorkflowId::generate(),
            WorkflowVersionId::generate(),
            TriggerType::Manual,
            JsonObject::new(),
        );
        ExecutionContext::for_run(&run).for_step(StepId::new("s1"))
    }

    fn make_executor(calls: Arc<AtomicUsize>, payload: &str) -> SandboxExecutor {
        let mut registry = ConnectorRegistry::new();
        registry.register(Box::new(CountingFactory {
            calls,
            payload: payload.to_string(),
        }));
        SandboxExecutor::new(Arc::new(registry))
    }

    #[tokio::test]
    async fn blocked_host_aborts_before_connector_runs() {
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = make_executor(calls.clone(), "ok").with_network_policy(
            NetworkPolicy::allow_all().with_blocked_host("10.*.*.*"),
        );

        let mut config = JsonObject::new();
        config.insert("url".to_string(), json!("http://10.0.0.5/internal"));

        let err = executor
            .execute_connector(&make_ctx(), "http", &config, "get", &JsonObject::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::PolicyViolation { policy: "network", .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disallowed_credential_aborts_before_connector_runs() {
        let calls = Arc::new(AtomicUsize::new(0));
        let executor = make_executor(calls.clone(), "ok")
            .with_network_policy(NetworkPolicy::allow_all())
            .with_secret_policy(SecretPolicy::allowing(["cred-1"]));

        let mut config = JsonObject::new();
        config.insert("credential_id".to_string(), json!("cred-2"));

        let err = executor
            .execute_connector(&make_ctx(), "http", &config, "get", &JsonObject::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::PolicyViolation { policy: "secret", .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn successful_execution_returns_outputs_and_metrics() {
        let calls = Arc::new(AtomicUsize::new(0));
        let executor =
            make_executor(calls.clone(), "hello").with_network_policy(NetworkPolicy::allow_all());

        let (outputs, metrics) = executor
            .execute_connector(
                &make_ctx(),
                "http",
                &JsonObject::new(),
                "get",
                &JsonObject::new(),
            )
            .await
            .unwrap();

        assert_eq!(outputs.get("body"), Some(&json!("hello")));
        assert!(metrics.errors.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn oversized_output_is_refused() {
        let calls = Arc::new(AtomicUsize::new(0));
        let big = "x".repeat(4096);
        let executor = make_executor(calls.clone(), &big)
            .with_network_policy(NetworkPolicy::allow_all())
            .with_limits(ResourceLimits::default().with_max_output_bytes(1024));

        let err = executor
            .execute_connector(
                &make_ctx(),
                "http",
                &JsonObject::new(),
                "get",
                &JsonObject::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SandboxError::ResourceExceeded { resource: "output", .. }
        ));
    }

    #[tokio::test]
    async fn unknown_connector_kind_is_an_initialization_error() {
        let executor = make_executor(Arc::new(AtomicUsize::new(0)), "ok")
            .with_network_policy(NetworkPolicy::allow_all());

        let err = executor
            .execute_connector(
                &make_ctx(),
                "missing",
                &JsonObject::new(),
                "get",
                &JsonObject::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SandboxError::Connector(ConnectorError::Initialization(_))
        ));
        assert!(!err.is_retryable());
    }
}
