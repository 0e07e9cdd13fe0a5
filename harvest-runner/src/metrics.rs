//! Run-level ETA and throughput.
//!
//! Recomputed from scratch on every snapshot: ETA is the average duration of
//! the jobs that actually ran, times the jobs remaining, divided by how many
//! are running right now. No smoothing, so early estimates are noisy.

use std::time::Duration;

use serde::Serialize;

use crate::controller::JobStatus;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub remaining: usize,
    pub active: usize,
    pub progress_percent: f64,
    pub avg_job_secs: Option<f64>,
    pub eta_secs: Option<f64>,
    pub eta_text: String,
    pub throughput_per_min: f64,
    pub elapsed_secs: f64,
}

/// Owned by the coordinator thread; never shared.
#[derive(Debug, Clone)]
pub struct MetricsAggregator {
    total: usize,
    active: usize,
    completed: usize,
    failed: usize,
    skipped: usize,
    cancelled: usize,
    ran: usize,
    ran_time: Duration,
}

impl MetricsAggregator {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            active: 0,
            completed: 0,
            failed: 0,
            skipped: 0,
            cancelled: 0,
            ran: 0,
            ran_time: Duration::ZERO,
        }
    }

    pub fn job_started(&mut self) {
        self.active += 1;
    }

    /// Record a terminal job. `ran` is the job's run time, `None` for jobs
    /// that never started.
    pub fn job_finished(&mut self, status: JobStatus, ran: Option<Duration>) {
        if let Some(duration) = ran {
            self.active = self.active.saturating_sub(1);
            self.ran += 1;
            self.ran_time += duration;
        }
        match status {
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Skipped => self.skipped += 1,
            JobStatus::Cancelled => self.cancelled += 1,
            JobStatus::Queued | JobStatus::Running | JobStatus::Paused => {}
        }
    }

    pub fn finished(&self) -> usize {
        self.completed + self.failed + self.skipped + self.cancelled
    }

    pub fn snapshot(&self, elapsed: Duration) -> MetricsSnapshot {
        let finished = self.finished();
        let remaining = self.total.saturating_sub(finished);
        let avg = (self.ran > 0).then(|| self.ran_time.as_secs_f64() / self.ran as f64);
        let eta = if remaining == 0 {
            Some(0.0)
        } else {
            avg.map(|a| a * remaining as f64 / self.active.max(1) as f64)
        };
        let minutes = elapsed.as_secs_f64() / 60.0;

        MetricsSnapshot {
            total: self.total,
            completed: self.completed,
            failed: self.failed,
            skipped: self.skipped,
            cancelled: self.cancelled,
            remaining,
            active: self.active,
            progress_percent: if self.total == 0 {
                100.0
            } else {
                finished as f64 / self.total as f64 * 100.0
            },
            avg_job_secs: avg,
            eta_secs: eta,
            eta_text: eta.map_or_else(|| "calculating...".to_string(), format_duration),
            throughput_per_min: if minutes > 0.0 {
                finished as f64 / minutes
            } else {
                0.0
            },
            elapsed_secs: elapsed.as_secs_f64(),
        }
    }
}

/// `1h 2m 3s`, `2m 3s` or `3s`.
pub fn format_duration(secs: f64) -> String {
    let total = secs.max(0.0).round() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}h {m}m {s}s")
    } else if m > 0 {
        format!("{m}m {s}s")
    } else {
        format!("{s}s")
    }
}
