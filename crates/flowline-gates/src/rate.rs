//! Per-workflow admission rate limiting.

use crate::{CounterStore, GateLimits, GateResult};
use chrono::{DateTime, Utc};
use flowline_types::WorkflowId;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const BUCKET_WIDTH_SECS: i64 = 60;

/// Buckets outlive their window by one extra width so a check at the
/// boundary never reads a half-expired bucket.
const BUCKET_TTL: Duration = Duration::from_secs(2 * BUCKET_WIDTH_SECS as u64);

/// Outcome of a rate check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    /// Admissions left in the current window.
    pub remaining: u32,
    pub limit: u32,
}

/// Fixed-window rate limiter: one counter bucket per workflow per
/// wall-clock minute. A burst at a bucket boundary can briefly see up
/// to twice the configured rate, which is accepted for the simplicity
/// of a single atomic increment per admission.
pub struct RateGate {
    counters: Arc<dyn CounterStore>,
}

impl RateGate {
    pub fn new(counters: Arc<dyn CounterStore>) -> Self {
        Self { counters }
    }

    fn bucket_key(workflow_id: &WorkflowId, now: DateTime<Utc>) -> String {
        let minute = now.timestamp().div_euclid(BUCKET_WIDTH_SECS);
        format!("rate:{workflow_id}:{minute}")
    }

    /// Check whether another admission fits in the current window.
    /// Read-only; does not record anything.
    pub async fn check_rate_limit(
        &self,
        workflow_id: &WorkflowId,
        limits: &GateLimits,
    ) -> GateResult<RateDecision> {
        self.check_rate_limit_at(workflow_id, limits, Utc::now())
            .await
    }

    pub(crate) async fn check_rate_limit_at(
        &self,
        workflow_id: &WorkflowId,
        limits: &GateLimits,
        now: DateTime<Utc>,
    ) -> GateResult<RateDecision> {
        let used = self
            .counters
            .get(&Self::bucket_key(workflow_id, now))
            .await?;
        let used = u32::try_from(used).unwrap_or(u32::MAX);
        let decision = RateDecision {
            allowed: used < limits.runs_per_minute,
            remaining: limits.runs_per_minute.saturating_sub(used),
            limit: limits.runs_per_minute,
        };
        if !decision.allowed {
            debug!(workflow_id = %workflow_id, used, limit = decision.limit, "rate window exhausted");
        }
        Ok(decision)
    }

    /// Record an admission in the current window.
    pub async fn record_run(&self, workflow_id: &WorkflowId) -> GateResult<()> {
        self.record_run_at(workflow_id, Utc::now()).await
    }

    pub(crate) async fn record_run_at(
        &self,
        workflow_id: &WorkflowId,
        now: DateTime<Utc>,
    ) -> GateResult<()> {
        self.counters
            .increment(&Self::bucket_key(workflow_id, now), Some(BUCKET_TTL))
            .await?;
        Ok(())
    }

    /// Admissions recorded in the current window.
    pub async fn current_rate(&self, workflow_id: &WorkflowId) -> GateResult<u32> {
        self.current_rate_at(workflow_id, Utc::now()).await
    }

    pub(crate) async fn current_rate_at(
        &self,
        workflow_id: &WorkflowId,
        now: DateTime<Utc>,
    ) -> GateResult<u32> {
        let used = self
            .counters
            .get(&Self::bucket_key(workflow_id, now))
            .await?;
        Ok(u32::try_from(used).unwrap_or(u32::MAX))
    }

    /// Administrative: drop all rate buckets for a workflow.
    pub async fn reset(&self, workflow_id: &WorkflowId) -> GateResult<u64> {
        self.counters
            .clear_prefix(&format!("rate:{workflow_id}:"))
            .await
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use flowline_store::InMemoryCounterStore;

    fn make_gate() -> RateGate {
        RateGate::new(Arc::new(InMemoryCounterStore::new()))
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_040, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    #[tokio::test]
    async fn fourth_admission_in_a_minute_is_denied() {
        let gate = make_gate();
        let wf = WorkflowId::generate();
        let limits = GateLimits::default().with_runs_per_minute(3);
        let now = at(0);

        for expected_remaining in [3, 2, 1] {
            let decision = gate.check_rate_limit_at(&wf, &limits, now).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
            gate.record_run_at(&wf, now).await.unwrap();
        }

        let decision = gate.check_rate_limit_at(&wf, &limits, now).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(gate.current_rate_at(&wf, now).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn next_minute_opens_a_fresh_bucket() {
        let gate = make_gate();
        let wf = WorkflowId::generate();
        let limits = GateLimits::default().with_runs_per_minute(1);

        gate.record_run_at(&wf, at(0)).await.unwrap();
        assert!(!gate.check_rate_limit_at(&wf, &limits, at(10)).await.unwrap().allowed);

        let next_minute = at(60);
        let decision = gate
            .check_rate_limit_at(&wf, &limits, next_minute)
            .await
            .unwrap();
        assert!(decision.allowed);
        assert_eq!(gate.current_rate_at(&wf, next_minute).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn workflows_have_independent_buckets() {
        let gate = make_gate();
        let (wf_a, wf_b) = (WorkflowId::generate(), WorkflowId::generate());
        let limits = GateLimits::default().with_runs_per_minute(1);
        let now = at(0);

        gate.record_run_at(&wf_a, now).await.unwrap();
        assert!(!gate.check_rate_limit_at(&wf_a, &limits, now).await.unwrap().allowed);
        assert!(gate.check_rate_limit_at(&wf_b, &limits, now).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn reset_clears_buckets() {
        let gate = make_gate();
        let wf = WorkflowId::generate();
        let now = at(0);

        gate.record_run_at(&wf, now).await.unwrap();
        gate.record_run_at(&wf, now).await.unwrap();
        assert_eq!(gate.reset(&wf).await.unwrap(), 1);
        assert_eq!(gate.current_rate_at(&wf, now).await.unwrap(), 0);
    }
}
