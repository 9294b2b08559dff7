//! Work handoff between run admission and run execution.

use crate::{EngineResult, RunDriver};
use async_trait::async_trait;
use flowline_types::RunId;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// One unit of dispatchable work.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkItem {
    /// Execute a run end to end.
    Run(RunId),
}

/// Backoff schedule for redelivered or retried work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with jitter. Jitter spreads simultaneous
    /// retries of many runs so they do not re-converge on a struggling
    /// upstream at the same instant.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(exp.as_secs_f64() * jitter).min(self.max_delay)
    }
}

/// Hands admitted runs to workers.
///
/// Delivery semantics are the substrate's contract, not the engine's:
/// a queue-backed implementation is expected to deliver at least once,
/// acknowledge only after the worker reaches a terminal state, and
/// redeliver work whose worker disappeared. The engine's conditional
/// transitions make duplicate delivery safe.
#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn dispatch(&self, item: WorkItem) -> EngineResult<()>;
}

/// In-process dispatcher backed by `tokio::spawn`. Suitable for local
/// mode and tests; work does not survive a process restart.
pub struct LocalTaskDispatcher {
    driver: Arc<RunDriver>,
}

impl LocalTaskDispatcher {
    pub fn new(driver: Arc<RunDriver>) -> Self {
        Self { driver }
    }
}

#[async_trait]
impl TaskDispatcher for LocalTaskDispatcher {
    async fn dispatch(&self, item: WorkItem) -> EngineResult<()> {
        let WorkItem::Run(run_id) = item;
        let driver = self.driver.clone();

        info!(run_id = %run_id, "dispatching run to local worker");
        tokio::spawn(async move {
            match driver.execute_run(&run_id).await {
                Ok(run) => {
                    info!(run_id = %run_id, status = %run.status, "local worker finished run")
                }
                Err(e) => error!(run_id = %run_id, error = %e, "local worker failed"),
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_stays_bounded() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };

        for attempt in 0..8 {
            let delay = policy.delay_for(attempt);
            assert!(delay <= policy.max_delay);
            // Jitter never shrinks below half the exponential value.
            let floor = policy
                .base_delay
                .saturating_mul(2u32.saturating_pow(attempt))
                .min(policy.max_delay)
                / 2;
            assert!(delay >= floor);
        }
    }

    #[test]
    fn jittered_delays_vary() {
        let policy = RetryPolicy::default();
        let delays: Vec<Duration> = (0..16).map(|_| policy.delay_for(1)).collect();
        assert!(delays.iter().any(|d| d != &delays[0]));
    }
}
