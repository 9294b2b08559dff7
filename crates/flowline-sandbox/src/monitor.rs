//! Per-execution resource and event tracking.

use crate::limits::ResourceUsage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use sysinfo::{Pid, ProcessRefreshKind, System};
use tracing::warn;

/// An error observed during an execution, kept for the metrics record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedError {
    pub error_type: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Serializable summary of one execution, attached to both success and
/// failure log events.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub duration_ms: u64,
    pub peak_memory_bytes: u64,
    pub cpu_secs: f64,
    pub network_requests: u64,
    #[serde(default)]
    pub errors: Vec<RecordedError>,
}

/// Tracks one execution: timing, a peak-memory high-water mark, CPU
/// time sampled from a watched pid, and counted events.
pub struct ExecutionMonitor {
    started: Instant,
    last_sample: Instant,
    pid: Option<Pid>,
    system: System,
    peak_memory_bytes: u64,
    cpu_secs: f64,
    network_requests: u64,
    errors: Vec<RecordedError>,
}

impl ExecutionMonitor {
    /// Begin monitoring; the clock starts immediately.
    pub fn start() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last_sample: now,
            pid: None,
            system: System::new(),
            peak_memory_bytes: 0,
            cpu_secs: 0.0,
            network_requests: 0,
            errors: Vec::new(),
        }
    }

    /// Watch a specific process for memory and CPU sampling.
    pub fn watch_pid(&mut self, pid: u32) {
        self.pid = Some(Pid::from_u32(pid));
    }

    /// Watch the current process. Used by the advisory limiter, where
    /// connector work shares our address space.
    pub fn watch_current_process(&mut self) {
        match sysinfo::get_current_pid() {
            Ok(pid) => self.pid = Some(pid),
            Err(e) => warn!(error = %e, "cannot determine current pid, memory sampling disabled"),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid.map(|p| p.as_u32())
    }

    /// Take a sample from the watched process, updating the peak
    /// memory mark and accumulating CPU time.
    pub fn sample(&mut self) {
        let Some(pid) = self.pid else { return };

        self.system
            .refresh_process_specifics(pid, ProcessRefreshKind::new().with_cpu().with_memory());
        let now = Instant::now();
        if let Some(process) = self.system.process(pid) {
            self.peak_memory_bytes = self.peak_memory_bytes.max(process.memory());
            let interval = now.duration_since(self.last_sample).as_secs_f64();
            self.cpu_secs += f64::from(process.cpu_usage()) / 100.0 * interval;
        }
        self.last_sample = now;
    }

    pub fn record_network_request(&mut self) {
        self.network_requests += 1;
    }

    pub fn record_error(&mut self, error_type: impl Into<String>, message: impl Into<String>) {
        self.errors.push(RecordedError {
            error_type: error_type.into(),
            message: message.into(),
            timestamp: Utc::now(),
        });
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    pub fn usage(&self) -> ResourceUsage {
        ResourceUsage {
            wall_clock: self.elapsed(),
            peak_memory_bytes: self.peak_memory_bytes,
            cpu_secs: self.cpu_secs,
        }
    }

    /// Close out the monitor and produce the metrics record.
    pub fn finish(self) -> ExecutionMetrics {
        ExecutionMetrics {
            duration_ms: self.started.elapsed().as_millis() as u64,
            peak_memory_bytes: self.peak_memory_bytes,
            cpu_secs: self.cpu_secs,
            network_requests: self.network_requests,
            errors: self.errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_accumulate_into_metrics() {
        let mut monitor = ExecutionMonitor::start();
        monitor.record_network_request();
        monitor.record_network_request();
        monitor.record_error("connector", "upstream timed out");

        let metrics = monitor.finish();
        assert_eq!(metrics.network_requests, 2);
        assert_eq!(metrics.errors.len(), 1);
        assert_eq!(metrics.errors[0].error_type, "connector");
    }

    #[test]
    fn sampling_without_a_pid_is_a_noop() {
        let mut monitor = ExecutionMonitor::start();
        monitor.sample();
        assert_eq!(monitor.usage().peak_memory_bytes, 0);
    }

    #[test]
    fn current_process_sampling_observes_memory() {
        let mut monitor = ExecutionMonitor::start();
        monitor.watch_current_process();
        monitor.sample();
        assert!(monitor.usage().peak_memory_bytes > 0);
    }
}
