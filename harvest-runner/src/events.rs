//! Events emitted by the controller over an `mpsc` channel.

use chrono::{DateTime, Utc};
use harvest_core::RateLimitSnapshot;
use serde::Serialize;

use crate::controller::RunSummary;
use crate::metrics::MetricsSnapshot;

/// Per-job progress report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    pub symbol: String,
    pub percent: f64,
    /// Free-text micro-stage ("fetching 2024-01-01..2024-01-31").
    pub stage: String,
    pub data_points: usize,
    pub api_calls: u32,
    pub elapsed_secs: f64,
    pub paused: bool,
}

/// Rate-limit usage summed over every worker's latest snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitUsage {
    pub workers: usize,
    pub minute_calls: usize,
    pub minute_limit: usize,
    pub daily_calls: u64,
    pub daily_limit: u64,
    pub daily_remaining: u64,
    pub max_consecutive_errors: u32,
    pub next_reset: Option<DateTime<Utc>>,
}

impl RateLimitUsage {
    pub fn aggregate<'a>(snapshots: impl IntoIterator<Item = &'a RateLimitSnapshot>) -> Self {
        let mut usage = Self {
            workers: 0,
            minute_calls: 0,
            minute_limit: 0,
            daily_calls: 0,
            daily_limit: 0,
            daily_remaining: 0,
            max_consecutive_errors: 0,
            next_reset: None,
        };
        for s in snapshots {
            usage.workers += 1;
            usage.minute_calls += s.minute_calls;
            usage.minute_limit += s.minute_limit;
            usage.daily_calls += s.daily_calls;
            usage.daily_limit += s.daily_limit;
            usage.daily_remaining += s.daily_remaining;
            usage.max_consecutive_errors = usage.max_consecutive_errors.max(s.consecutive_errors);
            usage.next_reset = Some(match usage.next_reset {
                Some(t) => t.min(s.next_reset),
                None => s.next_reset,
            });
        }
        usage
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    PipelineStarted { total: usize, workers: usize },
    JobStarted { symbol: String },
    Progress(ProgressUpdate),
    JobCompleted {
        symbol: String,
        data_points: usize,
        api_calls: u32,
        duration_secs: f64,
        message: Option<String>,
    },
    JobFailed { symbol: String, error: String },
    /// System-initiated "did not finish" (no data, unknown symbol, stopped
    /// before starting) or an operator skip.
    JobSkipped { symbol: String, reason: String },
    /// Operator-initiated stop of a job that had started.
    JobCancelled { symbol: String, reason: String },
    PipelinePaused,
    PipelineResumed,
    PipelineStopped(RunSummary),
    PipelineCompleted(RunSummary),
    PipelineCleared,
    Metrics(MetricsSnapshot),
    RateLimitUsage(RateLimitUsage),
}
