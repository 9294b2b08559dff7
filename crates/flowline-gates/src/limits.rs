use serde::{Deserialize, Serialize};

/// Per-workflow admission limits. Callers pass these on every check so
/// tenant- or plan-level overrides stay outside the gates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateLimits {
    /// Maximum number of simultaneously active runs per workflow.
    pub max_concurrent_runs: u32,
    /// Maximum run admissions per workflow per minute.
    pub runs_per_minute: u32,
}

impl Default for GateLimits {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 10,
            runs_per_minute: 60,
        }
    }
}

impl GateLimits {
    pub fn with_max_concurrent_runs(mut self, limit: u32) -> Self {
        self.max_concurrent_runs = limit;
        self
    }

    pub fn with_runs_per_minute(mut self, limit: u32) -> Self {
        self.runs_per_minute = limit;
        self
    }
}
