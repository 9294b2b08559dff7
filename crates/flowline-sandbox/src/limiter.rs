//! Resource limit enforcement strategies.
//!
//! The limiter seam exists because "enforce a memory budget" means
//! different things depending on where connector code runs. In-process
//! connectors can only be supervised advisorily (cancel the future,
//! sample the shared address space); connectors that shell out to a
//! subprocess can be supervised for real (sample the child's RSS/CPU
//! and kill it on breach).

use crate::connector::{ActionOutputs, ConnectorError};
use crate::error::{SandboxError, SandboxResult};
use crate::limits::ResourceLimits;
use crate::monitor::ExecutionMonitor;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::time::Duration;
use sysinfo::{Pid, System};
use tracing::warn;

/// Supervises one connector execution under resource limits.
#[async_trait]
pub trait ResourceLimiter: Send + Sync {
    /// Drive `work` to completion unless a budget is breached first.
    /// On breach the work is abandoned and the breach is reported as
    /// [`SandboxError::ResourceExceeded`].
    async fn supervise<'a>(
        &'a self,
        limits: &'a ResourceLimits,
        monitor: &'a mut ExecutionMonitor,
        work: BoxFuture<'a, Result<ActionOutputs, ConnectorError>>,
    ) -> SandboxResult<ActionOutputs>;
}

// ── Advisory (in-process) ────────────────────────────────────────────

/// In-process supervision: a wall-clock watchdog that cancels the
/// connector future, plus periodic memory sampling of our own process.
///
/// Memory readings cover the whole process, so the memory budget is a
/// circuit breaker against runaway connectors rather than an exact
/// per-step quota. CPU budgets are not enforceable at this level.
pub struct AdvisoryLimiter {
    sample_interval: Duration,
}

impl Default for AdvisoryLimiter {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_millis(250),
        }
    }
}

impl AdvisoryLimiter {
    pub fn new(sample_interval: Duration) -> Self {
        Self { sample_interval }
    }
}

#[async_trait]
impl ResourceLimiter for AdvisoryLimiter {
    async fn supervise<'a>(
        &'a self,
        limits: &'a ResourceLimits,
        monitor: &'a mut ExecutionMonitor,
        work: BoxFuture<'a, Result<ActionOutputs, ConnectorError>>,
    ) -> SandboxResult<ActionOutputs> {
        monitor.watch_current_process();

        let deadline = tokio::time::sleep(limits.max_wall_clock);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(self.sample_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut work = work;

        loop {
            tokio::select! {
                result = &mut work => return result.map_err(SandboxError::from),
                _ = &mut deadline => {
                    let budget = limits.max_wall_clock;
                    monitor.record_error("resource", format!("wall clock budget {budget:?} exhausted"));
                    return Err(SandboxError::resource_exceeded(
                        "wall_clock",
                        format!("execution exceeded {budget:?}"),
                    ));
                }
                _ = ticker.tick() => {
                    monitor.sample();
                    let peak = monitor.usage().peak_memory_bytes;
                    if peak > limits.max_memory_bytes {
                        monitor.record_error("resource", format!("memory peaked at {peak} bytes"));
                        return Err(SandboxError::resource_exceeded(
                            "memory",
                            format!("{peak} bytes used, budget {}", limits.max_memory_bytes),
                        ));
                    }
                }
            }
        }
    }
}

// ── Process-level ────────────────────────────────────────────────────

/// OS-level supervision of a connector that runs its work in a child
/// process. The caller attaches the child's pid to the monitor; the
/// limiter samples its RSS and CPU time and force-kills it on any
/// budget breach.
pub struct ProcessLimiter {
    sample_interval: Duration,
}

impl Default for ProcessLimiter {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_millis(250),
        }
    }
}

impl ProcessLimiter {
    pub fn new(sample_interval: Duration) -> Self {
        Self { sample_interval }
    }

    fn kill(pid: u32) {
        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        if system.refresh_process(pid) {
            if let Some(process) = system.process(pid) {
                if !process.kill() {
                    warn!(pid = pid.as_u32(), "failed to kill supervised process");
                }
            }
        }
    }

    fn breach(
        monitor: &mut ExecutionMonitor,
        resource: &'static str,
        message: String,
    ) -> SandboxError {
        monitor.record_error("resource", message.clone());
        if let Some(pid) = monitor.pid() {
            Self::kill(pid);
        }
        SandboxError::resource_exceeded(resource, message)
    }
}

#[async_trait]
impl ResourceLimiter for ProcessLimiter {
    async fn supervise<'a>(
        &'a self,
        limits: &'a ResourceLimits,
        monitor: &'a mut ExecutionMonitor,
        work: BoxFuture<'a, Result<ActionOutputs, ConnectorError>>,
    ) -> SandboxResult<ActionOutputs> {
        if monitor.pid().is_none() {
            warn!("process limiter engaged without a watched pid, supervising wall clock only");
        }

        let deadline = tokio::time::sleep(limits.max_wall_clock);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(self.sample_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut work = work;

        loop {
            tokio::select! {
                result = &mut work => return result.map_err(SandboxError::from),
                _ = &mut deadline => {
                    return Err(Self::breach(
                        monitor,
                        "wall_clock",
                        format!("execution exceeded {:?}", limits.max_wall_clock),
                    ));
                }
                _ = ticker.tick() => {
                    monitor.sample();
                    let usage = monitor.usage();
                    if usage.peak_memory_bytes > limits.max_memory_bytes {
                        return Err(Self::breach(
                            monitor,
                            "memory",
                            format!(
                                "{} bytes used, budget {}",
                                usage.peak_memory_bytes, limits.max_memory_bytes
                            ),
                        ));
                    }
                    if usage.cpu_secs > limits.max_cpu_secs {
                        return Err(Self::breach(
                            monitor,
                            "cpu",
                            format!(
                                "{:.1} cpu-seconds used, budget {:.1}",
                                usage.cpu_secs, limits.max_cpu_secs
                            ),
                        ));
                    }
                }
            }
        }
    }
}
