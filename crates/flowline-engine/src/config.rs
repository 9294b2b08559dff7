use flowline_gates::GateLimits;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine-wide tunables. Per-workflow overrides replace `gate_limits`
/// at call sites; everything else applies uniformly.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub gate_limits: GateLimits,
    /// Retry ceiling for retryable step failures.
    pub max_step_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gate_limits: GateLimits::default(),
            max_step_retries: 3,
            retry_base_delay: Duration::from_secs(2),
            retry_max_delay: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    pub fn with_gate_limits(mut self, limits: GateLimits) -> Self {
        self.gate_limits = limits;
        self
    }

    pub fn with_max_step_retries(mut self, retries: u32) -> Self {
        self.max_step_retries = retries;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }
}
