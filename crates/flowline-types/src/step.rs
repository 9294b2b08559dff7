//! Run steps: execution instances of single graph nodes.

use crate::{GraphNode, JsonObject, RunId, StepId, StepStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One execution instance of a graph node within a run.
///
/// Steps are created in bulk when the run is created - one per graph
/// node, preserving node order as `execution_order` - and mutated by
/// the orchestrator as execution proceeds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunStep {
    pub run_id: RunId,
    /// Matches the graph node id
    pub step_id: StepId,
    /// Connector kind, copied from the node
    pub step_type: String,
    pub status: StepStatus,
    #[serde(default)]
    pub inputs: JsonObject,
    #[serde(default)]
    pub outputs: JsonObject,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Position in graph declaration order
    pub execution_order: u32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunStep {
    /// Build a pending step from a graph node.
    pub fn from_node(run_id: RunId, node: &GraphNode, execution_order: u32) -> Self {
        Self {
            run_id,
            step_id: node.id.clone(),
            step_type: node.step_type.clone(),
            status: StepStatus::Pending,
            inputs: node.declared_inputs(),
            outputs: JsonObject::new(),
            error: None,
            execution_order,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Build a step that is skipped from birth, carrying forward
    /// outputs from a prior run (partial replay prefix).
    pub fn skipped_with_outputs(
        run_id: RunId,
        node: &GraphNode,
        execution_order: u32,
        outputs: JsonObject,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            step_id: node.id.clone(),
            step_type: node.step_type.clone(),
            status: StepStatus::Skipped,
            inputs: node.declared_inputs(),
            outputs,
            error: None,
            execution_order,
            created_at: now,
            started_at: None,
            finished_at: Some(now),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_node_seeds_declared_inputs() {
        let node = GraphNode::new("fetch", "http")
            .with_config_entry("inputs", json!({"url": "https://api.example.com/a"}));
        let step = RunStep::from_node(RunId::generate(), &node, 0);

        assert_eq!(step.step_id, StepId::new("fetch"));
        assert_eq!(step.step_type, "http");
        assert_eq!(step.status, StepStatus::Pending);
        assert_eq!(step.execution_order, 0);
        assert_eq!(
            step.inputs.get("url").and_then(|v| v.as_str()),
            Some("https://api.example.com/a")
        );
    }

    #[test]
    fn skipped_step_is_terminal_with_outputs() {
        let node = GraphNode::new("fetch", "http");
        let mut outputs = JsonObject::new();
        outputs.insert("out".into(), json!("A"));

        let step = RunStep::skipped_with_outputs(RunId::generate(), &node, 0, outputs.clone());
        assert_eq!(step.status, StepStatus::Skipped);
        assert!(step.is_terminal());
        assert_eq!(step.outputs, outputs);
        assert!(step.finished_at.is_some());
    }
}
