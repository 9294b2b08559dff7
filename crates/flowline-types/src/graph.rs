//! Workflow graph definitions and immutable versions.
//!
//! A [`GraphDefinition`] is the authored shape of a workflow: connector
//! nodes plus directed edges. A [`WorkflowVersion`] freezes one such
//! graph; versions are never mutated after creation except for the
//! `is_active` flag, and exactly one version per workflow is active at
//! a time (enforced on write by the version store).

use crate::{GraphError, JsonObject, StepId, WorkflowId, WorkflowVersionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// ── Nodes and edges ──────────────────────────────────────────────────

/// One connector step in a workflow graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    /// Authored node id, unique within the graph
    pub id: StepId,
    /// Connector kind executing this node (e.g. `"http"`, `"llm"`)
    pub step_type: String,
    /// Human-readable label
    pub name: String,
    /// Connector configuration. Recognised engine keys:
    /// `inputs` (object seeded into the step at run creation),
    /// `action` (connector action id),
    /// `output_keys` (declared output shape, validated best-effort).
    #[serde(default)]
    pub config: JsonObject,
}

impl GraphNode {
    pub fn new(id: impl Into<String>, step_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id: StepId::new(id),
            step_type: step_type.into(),
            config: JsonObject::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_config(mut self, config: JsonObject) -> Self {
        self.config = config;
        self
    }

    pub fn with_config_entry(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// Seed inputs declared in the node config, if any.
    pub fn declared_inputs(&self) -> JsonObject {
        match self.config.get("inputs") {
            Some(serde_json::Value::Object(map)) => map.clone(),
            _ => JsonObject::new(),
        }
    }

    /// Output keys the node declares it will produce, if any.
    pub fn declared_output_keys(&self) -> Vec<String> {
        match self.config.get("output_keys") {
            Some(serde_json::Value::Array(keys)) => keys
                .iter()
                .filter_map(|k| k.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// A directed edge between two graph nodes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub source: StepId,
    pub target: StepId,
}

impl GraphEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: StepId::new(source),
            target: StepId::new(target),
        }
    }
}

// ── Graph definition ─────────────────────────────────────────────────

/// The authored workflow graph: ordered nodes plus directed edges.
///
/// Node order is significant - run steps are created and offered for
/// execution in declaration order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
pub struct GraphDefinition {
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub edges: Vec<GraphEdge>,
}

impl GraphDefinition {
    pub fn new(nodes: Vec<GraphNode>, edges: Vec<GraphEdge>) -> Self {
        Self { nodes, edges }
    }

    pub fn get_node(&self, id: &StepId) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &StepId> {
        self.nodes.iter().map(|n| &n.id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Validate structural invariants: non-empty, unique node ids,
    /// edges referencing existing nodes.
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.nodes.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(&node.id) {
                return Err(GraphError::DuplicateNodeId(node.id.to_string()));
            }
        }

        for edge in &self.edges {
            if !seen.contains(&edge.source) {
                return Err(GraphError::UnknownEdgeEndpoint(edge.source.to_string()));
            }
            if !seen.contains(&edge.target) {
                return Err(GraphError::UnknownEdgeEndpoint(edge.target.to_string()));
            }
        }

        Ok(())
    }
}

// ── Workflow version ─────────────────────────────────────────────────

/// An immutable snapshot of a workflow graph.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowVersion {
    pub id: WorkflowVersionId,
    pub workflow_id: WorkflowId,
    /// Monotonic version number within the workflow
    pub version: u32,
    pub graph: GraphDefinition,
    /// Whether this is the workflow's active version
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl WorkflowVersion {
    pub fn new(workflow_id: WorkflowId, version: u32, graph: GraphDefinition) -> Self {
        Self {
            id: WorkflowVersionId::generate(),
            workflow_id,
            version,
            graph,
            is_active: false,
            created_at: Utc::now(),
        }
    }

    pub fn activated(mut self) -> Self {
        self.is_active = true;
        self
    }
}
