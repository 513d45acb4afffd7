use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Worker pool operational metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolMetrics {
    /// Configured slot count.
    pub pool_size: usize,
    /// Slots currently handed to an invocation.
    pub busy_workers: usize,
    /// busy_workers / pool_size (0.0 - 1.0).
    pub worker_utilization: f64,
    pub runs_submitted: u64,
    pub runs_resolved: u64,
    pub runs_failed: u64,
    pub runs_canceled: u64,
    /// Successful invocations, including ones whose run had already settled.
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// Completions that arrived after their run settled.
    pub tasks_discarded: u64,
    pub retries_scheduled: u64,
    pub workers_terminated: u64,
    /// Mean invocation duration over all successful tasks.
    pub avg_task_duration: Duration,
    pub last_completion: Option<DateTime<Utc>>,
}

impl PoolMetrics {
    pub(crate) fn new(pool_size: usize) -> Self {
        Self {
            pool_size,
            ..Self::default()
        }
    }

    pub(crate) fn set_busy(&mut self, busy: usize) {
        self.busy_workers = busy;
        self.worker_utilization = if self.pool_size == 0 {
            0.0
        } else {
            busy as f64 / self.pool_size as f64
        };
    }

    /// Record a successful invocation.
    pub(crate) fn record_completion(&mut self, duration: Duration) {
        self.tasks_completed += 1;
        self.last_completion = Some(Utc::now());

        // Incremental mean: new_avg = prev_avg + (duration - prev_avg) / count
        let count = self.tasks_completed;
        self.avg_task_duration = if count == 1 {
            duration
        } else {
            let prev_nanos = self.avg_task_duration.as_nanos() as f64;
            let cur_nanos = duration.as_nanos() as f64;
            let avg_nanos = prev_nanos + (cur_nanos - prev_nanos) / count as f64;
            Duration::from_nanos(avg_nanos as u64)
        };
    }
}
