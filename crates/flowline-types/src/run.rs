//! Runs: execution instances of a workflow version.

use crate::{JsonObject, RunId, RunStatus, StepId, WorkflowId, WorkflowVersionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Trigger ──────────────────────────────────────────────────────────

/// How a run was triggered. Trigger sources all funnel into
/// `Orchestrator::create_run` with one of these tags; their wire
/// formats live outside the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Webhook,
    Cron,
    Manual,
    Event,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Cron => "cron",
            Self::Manual => "manual",
            Self::Event => "event",
        }
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Replay lineage ───────────────────────────────────────────────────

/// Whether a replay re-ran the whole graph or resumed from a step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayKind {
    Full,
    Partial,
}

impl ReplayKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Partial => "partial",
        }
    }
}

/// Pointer from a replay run back to the run it was created from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayLineage {
    /// The run this replay was created from
    pub replay_of: RunId,
    pub kind: ReplayKind,
    /// For partial replays, the step the new run resumed from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<StepId>,
}

// ── Run ──────────────────────────────────────────────────────────────

/// One execution instance of a workflow version.
///
/// Created by the orchestrator, mutated only through
/// lifecycle-validated transitions, immutable once terminal except for
/// trace/log attachment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub workflow_id: WorkflowId,
    pub workflow_version_id: WorkflowVersionId,
    pub status: RunStatus,
    pub trigger: TriggerType,
    /// Trigger payload the run started from
    #[serde(default)]
    pub input: JsonObject,
    /// `{step_id: outputs}` aggregated from completed steps
    #[serde(default)]
    pub output: JsonObject,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Caller-supplied dedup token, unique per workflow version
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Present when this run is a replay of another run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay: Option<ReplayLineage>,
    /// Input snapshot captured at first replay attempt, reused by
    /// every later replay of this run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay_input: Option<JsonObject>,
    /// Actor or system that triggered the run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(
        workflow_id: WorkflowId,
        workflow_version_id: WorkflowVersionId,
        trigger: TriggerType,
        input: JsonObject,
    ) -> Self {
        Self {
            id: RunId::generate(),
            workflow_id,
            workflow_version_id,
            status: RunStatus::Pending,
            trigger,
            input,
            output: JsonObject::new(),
            error: None,
            idempotency_key: None,
            replay: None,
            replay_input: None,
            triggered_by: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_lineage(mut self, lineage: ReplayLineage) -> Self {
        self.replay = Some(lineage);
        self
    }

    pub fn with_triggered_by(mut self, actor: impl Into<String>) -> Self {
        self.triggered_by = Some(actor.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock duration, when both endpoints are known.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }
}
