//! Aggregate service statistics.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::jobs::{now_ms, Job, JobStatus};

/// Counters across the life of the process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatsSnapshot {
    pub total_jobs_processed: u64,
    pub successful_jobs: u64,
    pub failed_jobs: u64,
    pub cancelled_jobs: u64,
    /// Wall-clock seconds spent transcoding, summed over completed jobs.
    pub total_transcode_time_s: f64,
    /// Histogram of encoder families actually used.
    pub hw_accel_usage: HashMap<String, u64>,
    pub started_at_ms: i64,
}

impl Default for StatsSnapshot {
    fn default() -> Self {
        Self {
            total_jobs_processed: 0,
            successful_jobs: 0,
            failed_jobs: 0,
            cancelled_jobs: 0,
            total_transcode_time_s: 0.0,
            hw_accel_usage: HashMap::new(),
            started_at_ms: now_ms(),
        }
    }
}

impl StatsSnapshot {
    /// Record one job reaching a terminal state.
    pub fn record_job_complete(&mut self, job: &Job) {
        self.total_jobs_processed += 1;
        match job.status {
            JobStatus::Ready => self.successful_jobs += 1,
            JobStatus::Cancelled => self.cancelled_jobs += 1,
            _ => self.failed_jobs += 1,
        }
        if let Some(family) = &job.hw_accel_used {
            *self.hw_accel_usage.entry(family.clone()).or_insert(0) += 1;
        }
        if let (Some(started), Some(finished)) = (job.started_at, job.finished_at) {
            self.total_transcode_time_s += (finished - started).max(0) as f64 / 1000.0;
        }
    }

    pub fn uptime_seconds(&self) -> f64 {
        (now_ms() - self.started_at_ms).max(0) as f64 / 1000.0
    }
}

/// Shared statistics state for concurrent access across components.
pub type SharedStats = Arc<RwLock<StatsSnapshot>>;

/// Creates a new SharedStats instance with default values.
pub fn new_shared_stats() -> SharedStats {
    Arc::new(RwLock::new(StatsSnapshot::default()))
}
