//! Storage-side record shapes: patches, paging, trace envelopes.

use chrono::{DateTime, Utc};
use flowline_types::{JsonObject, ReplayLineage, Run, RunId, RunStep, RunTrace};
use serde::{Deserialize, Serialize};

/// Generic query window for paged reads.
#[derive(Debug, Clone, Copy)]
pub struct QueryWindow {
    pub limit: usize,
    pub offset: usize,
}

impl Default for QueryWindow {
    fn default() -> Self {
        Self {
            limit: 100,
            offset: 0,
        }
    }
}

/// Optional-field patch applied to a run alongside (or independent of)
/// a status transition. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output: Option<JsonObject>,
    pub error: Option<String>,
    pub replay: Option<ReplayLineage>,
    pub replay_input: Option<JsonObject>,
    pub triggered_by: Option<String>,
}

impl RunPatch {
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(at),
            ..Self::default()
        }
    }

    pub fn finished(at: DateTime<Utc>) -> Self {
        Self {
            finished_at: Some(at),
            ..Self::default()
        }
    }

    pub fn with_output(mut self, output: JsonObject) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Apply the patch to an owned run record.
    pub fn apply(self, run: &mut Run) {
        if let Some(at) = self.started_at {
            run.started_at = Some(at);
        }
        if let Some(at) = self.finished_at {
            run.finished_at = Some(at);
        }
        if let Some(output) = self.output {
            run.output = output;
        }
        if let Some(error) = self.error {
            run.error = Some(error);
        }
        if let Some(replay) = self.replay {
            run.replay = Some(replay);
        }
        if let Some(input) = self.replay_input {
            run.replay_input = Some(input);
        }
        if let Some(actor) = self.triggered_by {
            run.triggered_by = Some(actor);
        }
    }
}

/// Optional-field patch applied to a step alongside a status transition.
#[derive(Debug, Clone, Default)]
pub struct StepPatch {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub inputs: Option<JsonObject>,
    pub outputs: Option<JsonObject>,
    pub error: Option<String>,
}

impl StepPatch {
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(at),
            ..Self::default()
        }
    }

    pub fn finished(at: DateTime<Utc>) -> Self {
        Self {
            finished_at: Some(at),
            ..Self::default()
        }
    }

    pub fn with_inputs(mut self, inputs: JsonObject) -> Self {
        self.inputs = Some(inputs);
        self
    }

    pub fn with_outputs(mut self, outputs: JsonObject) -> Self {
        self.outputs = Some(outputs);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn apply(self, step: &mut RunStep) {
        if let Some(at) = self.started_at {
            step.started_at = Some(at);
        }
        if let Some(at) = self.finished_at {
            step.finished_at = Some(at);
        }
        if let Some(inputs) = self.inputs {
            step.inputs = inputs;
        }
        if let Some(outputs) = self.outputs {
            step.outputs = outputs;
        }
        if let Some(error) = self.error {
            step.error = Some(error);
        }
    }
}

/// Persisted trace envelope. The trace itself is derived data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub run_id: RunId,
    pub trace: RunTrace,
    pub updated_at: DateTime<Utc>,
}

impl TraceRecord {
    pub fn new(trace: RunTrace) -> Self {
        Self {
            run_id: trace.run_id.clone(),
            trace,
            updated_at: Utc::now(),
        }
    }
}
