use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Resource budgets for one connector execution.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Wall-clock budget for the whole execution.
    pub max_wall_clock: Duration,
    pub max_memory_bytes: u64,
    /// CPU-time budget; only enforceable by the process-level limiter.
    pub max_cpu_secs: f64,
    /// Serialized size cap on the action outputs.
    pub max_output_bytes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_wall_clock: Duration::from_secs(300),
            max_memory_bytes: 512 * 1024 * 1024,
            max_cpu_secs: 60.0,
            max_output_bytes: 10 * 1024 * 1024,
        }
    }
}

impl ResourceLimits {
    pub fn with_max_wall_clock(mut self, budget: Duration) -> Self {
        self.max_wall_clock = budget;
        self
    }

    pub fn with_max_memory_bytes(mut self, budget: u64) -> Self {
        self.max_memory_bytes = budget;
        self
    }

    pub fn with_max_cpu_secs(mut self, budget: f64) -> Self {
        self.max_cpu_secs = budget;
        self
    }

    pub fn with_max_output_bytes(mut self, budget: u64) -> Self {
        self.max_output_bytes = budget;
        self
    }
}

/// Resources actually consumed by an execution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub wall_clock: Duration,
    pub peak_memory_bytes: u64,
    pub cpu_secs: f64,
}
