//! The connector interface and its registry.

use async_trait::async_trait;
use flowline_types::JsonObject;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::info;

/// Outputs produced by a single connector action.
pub type ActionOutputs = JsonObject;

/// Errors a connector implementation may raise.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("connector initialization failed: {0}")]
    Initialization(String),

    #[error("connector '{kind}' does not support action '{action}'")]
    UnsupportedAction { kind: String, action: String },

    /// A failure during the action itself (remote error, timeout,
    /// malformed response). The only retryable class.
    #[error("action failed: {0}")]
    Action(String),
}

impl ConnectorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Action(_))
    }
}

// ── Manifest ─────────────────────────────────────────────────────────

/// Description of one action a connector can execute.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub id: String,
    pub description: String,
    /// Input keys the action reads.
    #[serde(default)]
    pub input_keys: Vec<String>,
    /// Output keys the action produces on success.
    #[serde(default)]
    pub output_keys: Vec<String>,
}

/// Static self-description of a connector.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorManifest {
    /// Stable type identifier, referenced by workflow step configs.
    pub kind: String,
    pub name: String,
    pub actions: Vec<ActionSpec>,
}

impl ConnectorManifest {
    pub fn action(&self, id: &str) -> Option<&ActionSpec> {
        self.actions.iter().find(|a| a.id == id)
    }
}

// ── Connector ────────────────────────────────────────────────────────

/// An integration adapter executed inside the sandbox.
///
/// Implementations hold per-step state set up by `initialize` (API
/// clients, parsed credentials); a fresh instance is created for every
/// execution, so they never see state from other runs.
#[async_trait]
pub trait Connector: Send + Sync {
    fn manifest(&self) -> &ConnectorManifest;

    /// Prepare the connector with the step's configuration.
    async fn initialize(&mut self, config: &JsonObject) -> Result<(), ConnectorError>;

    /// Execute one action with the given inputs.
    async fn execute(
        &self,
        action_id: &str,
        inputs: &JsonObject,
    ) -> Result<ActionOutputs, ConnectorError>;
}

/// Creates fresh connector instances of one kind.
pub trait ConnectorFactory: Send + Sync {
    fn kind(&self) -> &str;

    fn create(&self) -> Box<dyn Connector>;
}

// ── Registry ─────────────────────────────────────────────────────────

/// Explicitly constructed connector catalog.
///
/// The registry is built and owned by the process entry point and
/// handed to the executor by reference; there is no global instance.
#[derive(Default)]
pub struct ConnectorRegistry {
    factories: HashMap<String, Box<dyn ConnectorFactory>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory; a later registration for the same kind
    /// replaces the earlier one.
    pub fn register(&mut self, factory: Box<dyn ConnectorFactory>) {
        self.factories.insert(factory.kind().to_string(), factory);
    }

    pub fn factory(&self, kind: &str) -> Option<&dyn ConnectorFactory> {
        self.factories.get(kind).map(|f| f.as_ref())
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Lifecycle hook called once by the owning process at startup.
    pub async fn init(&self) {
        info!(connectors = self.factories.len(), "connector registry initialized");
    }

    /// Lifecycle hook called once by the owning process at shutdown.
    pub async fn shutdown(&self) {
        info!("connector registry shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopConnector {
        manifest: ConnectorManifest,
    }

    #[async_trait]
    impl Connector for NoopConnector {
        fn manifest(&self) -> &ConnectorManifest {
            &self.manifest
        }

        async fn initialize(&mut self, _config: &JsonObject) -> Result<(), ConnectorError> {
            Ok(())
        }

        async fn execute(
            &self,
            action_id: &str,
            _inputs: &JsonObject,
        ) -> Result<ActionOutputs, ConnectorError> {
            if self.manifest.action(action_id).is_none() {
                return Err(ConnectorError::UnsupportedAction {
                    kind: self.manifest.kind.clone(),
                    action: action_id.to_string(),
                });
            }
            Ok(ActionOutputs::new())
        }
    }

    struct NoopFactory;

    impl ConnectorFactory for NoopFactory {
        fn kind(&self) -> &str {
            "noop"
        }

        fn create(&self) -> Box<dyn Connector> {
            Box::new(NoopConnector {
                manifest: ConnectorManifest {
                    kind: "noop".to_string(),
                    name: "No-op".to_string(),
                    actions: vec![ActionSpec {
                        id: "ping".to_string(),
                        description: "Does nothing".to_string(),
                        input_keys: vec![],
                        output_keys: vec![],
                    }],
                },
            })
        }
    }

    #[test]
    fn registry_lookup_by_kind() {
        let mut registry = ConnectorRegistry::new();
        registry.register(Box::new(NoopFactory));

        assert!(registry.factory("noop").is_some());
        assert!(registry.factory("missing").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn unsupported_action_is_not_retryable() {
        let connector = NoopFactory.create();
        let err = connector
            .execute("does-not-exist", &JsonObject::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::UnsupportedAction { .. }));
        assert!(!err.is_retryable());
        assert!(ConnectorError::Action("boom".to_string()).is_retryable());
    }
}
