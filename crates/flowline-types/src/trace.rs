//! Derived execution traces.
//!
//! A trace is a queryable, rebuildable view of one run's execution:
//! ordered step summaries plus run-level counts. Traces are never
//! authoritative - they can always be recomputed from Run/RunStep/Log
//! records. Step payload *values* deliberately never enter the trace;
//! only input/output key names do, so trace size stays bounded
//! regardless of payload size.

use crate::{LogLevel, LogRecord, RunId, RunStatus, StepId, StepStatus, TriggerType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Summary of one step's execution within a trace.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepTrace {
    pub step_id: StepId,
    pub step_type: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Key names only, never values
    pub input_keys: Vec<String>,
    pub output_keys: Vec<String>,
    /// Log records attached to this step, oldest first
    pub logs: Vec<LogRecord>,
}

/// Run-level counters for a trace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TraceSummary {
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
    pub total_logs: usize,
    pub error_logs: usize,
    pub warning_logs: usize,
}

impl TraceSummary {
    pub fn count_log(&mut self, level: LogLevel) {
        self.total_logs += 1;
        match level {
            LogLevel::Error => self.error_logs += 1,
            LogLevel::Warn => self.warning_logs += 1,
            _ => {}
        }
    }
}

/// The full derived trace for one run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunTrace {
    pub run_id: RunId,
    pub status: RunStatus,
    pub trigger: TriggerType,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Step summaries in execution order
    pub steps: Vec<StepTrace>,
    pub summary: TraceSummary,
}
