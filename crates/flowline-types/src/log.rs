//! Structured log records attached to runs and steps.

use crate::{JsonObject, RunId, StepId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of a persisted log record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// A structured log record persisted alongside run/step state.
///
/// These records feed the trace aggregator; they are audit data, not a
/// replacement for process-level tracing output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: String,
    pub run_id: RunId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    pub level: LogLevel,
    pub message: String,
    /// Structured event fields (e.g. from/to statuses, metrics)
    #[serde(default)]
    pub fields: JsonObject,
    pub created_at: DateTime<Utc>,
}

impl LogRecord {
    pub fn new(run_id: RunId, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id,
            step_id: None,
            level,
            message: message.into(),
            fields: JsonObject::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_step(mut self, step_id: StepId) -> Self {
        self.step_id = Some(step_id);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}
