//! Job controller: worker pool, per-job state machine, live control.
//!
//! Threads:
//! - N pool workers (private rayon pool), each owning one `Fetcher`
//! - one coordinator thread, the only writer of the status table; it also
//!   owns the `MetricsAggregator` and emits periodic snapshots
//!
//! The caller keeps a `JobController` for submit/wait/clear and hands out
//! cloneable `ControlHandle`s for pause/resume/cancel/skip and status.
//!
//! Per-job states: queued → running ⇄ paused → {completed | failed |
//! skipped | cancelled}. Cancelled means an operator (or a run stop) ended a
//! job that had started; skipped covers "did not finish" for any other
//! reason, including jobs a stopped run never reached.

use std::collections::HashSet;
use std::sync::atomic::AtomicUsize;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use harvest_core::{
    Clock, DataProvider, JobFlags, RangeCache, RateLimitSnapshot, RetryPolicy, RunFlags,
};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::collaborators::{FeatureProcessor, ProfileStore};
use crate::config::{FetchMode, PipelineConfig, PipelineSettings};
use crate::events::{PipelineEvent, RateLimitUsage};
use crate::job::{worker_loop, JobOutcome, JobSpec, WorkerContext, WorkerMsg};
use crate::metrics::{MetricsAggregator, MetricsSnapshot};

/// Per-run fetch options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub mode: FetchMode,
    pub max_history_days: u32,
    pub chunk_days: u32,
}

impl RunOptions {
    pub fn from_settings(settings: &PipelineSettings) -> Self {
        Self {
            mode: settings.mode,
            max_history_days: settings.max_history_days,
            chunk_days: settings.chunk_days,
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from_settings(&PipelineSettings::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Skipped | JobStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub symbol: String,
    pub status: JobStatus,
    pub progress: f64,
    pub stage: String,
    pub data_points: usize,
    pub api_calls: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Stopping,
    Finished,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub total_api_calls: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub state: RunState,
    pub total: usize,
    pub counters: Counters,
    pub jobs: Vec<JobSnapshot>,
    pub metrics: Option<MetricsSnapshot>,
}

impl PipelineStatus {
    pub fn job(&self, symbol: &str) -> Option<&JobSnapshot> {
        let symbol = normalize(symbol);
        self.jobs.iter().find(|j| j.symbol == symbol)
    }
}

/// Final tally of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub duration: Duration,
    pub total_api_calls: u64,
    /// The run was stopped with `cancel()`.
    pub stopped: bool,
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("a run is already in progress")]
    AlreadyRunning,

    #[error("no run in progress")]
    NotRunning,

    #[error("cannot {0} while a run is active")]
    RunActive(&'static str),

    #[error("no symbols submitted")]
    NoSymbols,

    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("job {symbol} already finished ({status})")]
    JobFinished { symbol: String, status: JobStatus },

    #[error("failed to build worker pool: {0}")]
    Pool(String),

    #[error("failed to spawn coordinator thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("coordinator thread panicked")]
    CoordinatorPanicked,
}

// ── Status table ─────────────────────────────────────────────────────

struct JobRecord {
    snapshot: JobSnapshot,
    flags: Arc<JobFlags>,
}

/// Written by the coordinator; the control handle only flips flags and the
/// paused/stopping states.
struct RunTable {
    state: RunState,
    flags: Arc<RunFlags>,
    jobs: Vec<JobRecord>,
    counters: Counters,
    metrics: Option<MetricsSnapshot>,
}

impl RunTable {
    fn idle() -> Self {
        Self {
            state: RunState::Idle,
            flags: Arc::new(RunFlags::new()),
            jobs: Vec::new(),
            counters: Counters::default(),
            metrics: None,
        }
    }

    fn status(&self) -> PipelineStatus {
        PipelineStatus {
            state: self.state,
            total: self.jobs.len(),
            counters: self.counters.clone(),
            jobs: self.jobs.iter().map(|j| j.snapshot.clone()).collect(),
            metrics: self.metrics.clone(),
        }
    }

    fn live_status(&self, job: &JobRecord) -> JobStatus {
        if job.flags.is_paused() || self.flags.is_paused() {
            JobStatus::Paused
        } else {
            JobStatus::Running
        }
    }
}

fn normalize(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

// ── Control handle ───────────────────────────────────────────────────

/// Cloneable remote control for the current run.
#[derive(Clone)]
pub struct ControlHandle {
    table: Arc<Mutex<RunTable>>,
    events: Sender<PipelineEvent>,
}

impl ControlHandle {
    /// Pause every job at its next checkpoint. Worker slots stay occupied.
    pub fn pause(&self) {
        let mut table = self.table.lock();
        if table.state != RunState::Running {
            return;
        }
        table.flags.pause();
        table.state = RunState::Paused;
        for job in &mut table.jobs {
            if job.snapshot.status == JobStatus::Running {
                job.snapshot.status = JobStatus::Paused;
            }
        }
        drop(table);
        info!("pipeline paused");
        let _ = self.events.send(PipelineEvent::PipelinePaused);
    }

    pub fn resume(&self) {
        let mut table = self.table.lock();
        if table.state != RunState::Paused {
            return;
        }
        table.flags.resume();
        table.state = RunState::Running;
        for job in &mut table.jobs {
            if job.snapshot.status == JobStatus::Paused && !job.flags.is_paused() {
                job.snapshot.status = JobStatus::Running;
            }
        }
        drop(table);
        info!("pipeline resumed");
        let _ = self.events.send(PipelineEvent::PipelineResumed);
    }

    /// Stop the run. Running jobs end `cancelled` at their next checkpoint;
    /// jobs not yet started end `skipped`.
    pub fn cancel(&self) {
        let mut table = self.table.lock();
        if !matches!(table.state, RunState::Running | RunState::Paused) {
            return;
        }
        table.flags.cancel();
        table.state = RunState::Stopping;
        warn!("pipeline stop requested");
    }

    pub fn pause_symbol(&self, symbol: &str) -> Result<(), ControllerError> {
        self.with_live_job(symbol, |job, _| {
            job.flags.pause();
            if job.snapshot.status == JobStatus::Running {
                job.snapshot.status = JobStatus::Paused;
            }
        })
    }

    pub fn resume_symbol(&self, symbol: &str) -> Result<(), ControllerError> {
        self.with_live_job(symbol, |job, run| {
            job.flags.resume();
            if job.snapshot.status == JobStatus::Paused && !run.is_paused() {
                job.snapshot.status = JobStatus::Running;
            }
        })
    }

    pub fn cancel_symbol(&self, symbol: &str) -> Result<(), ControllerError> {
        self.with_live_job(symbol, |job, _| job.flags.cancel())
    }

    /// Drop a job: a queued job never starts, a running one stops at its
    /// next checkpoint. Either way it ends `skipped`.
    pub fn skip(&self, symbol: &str) -> Result<(), ControllerError> {
        self.with_live_job(symbol, |job, _| job.flags.skip())
    }

    pub fn status(&self) -> PipelineStatus {
        self.table.lock().status()
    }

    fn with_live_job(
        &self,
        symbol: &str,
        apply: impl FnOnce(&mut JobRecord, &RunFlags),
    ) -> Result<(), ControllerError> {
        let symbol = normalize(symbol);
        let mut table = self.table.lock();
        let run = table.flags.clone();
        let job = table
            .jobs
            .iter_mut()
            .find(|j| j.snapshot.symbol == symbol)
            .ok_or_else(|| ControllerError::UnknownSymbol(symbol.clone()))?;
        if job.snapshot.status.is_terminal() {
            return Err(ControllerError::JobFinished {
                symbol,
                status: job.snapshot.status,
            });
        }
        apply(job, &run);
        info!(symbol = %symbol, "job control request applied");
        Ok(())
    }
}

// ── Controller ───────────────────────────────────────────────────────

pub struct JobController {
    config: PipelineConfig,
    provider: Arc<dyn DataProvider>,
    cache: Arc<RangeCache>,
    features: Arc<dyn FeatureProcessor>,
    store: Arc<dyn ProfileStore>,
    clock: Arc<dyn Clock>,
    events: Sender<PipelineEvent>,
    table: Arc<Mutex<RunTable>>,
    active: Option<JoinHandle<RunSummary>>,
    last_options: RunOptions,
}

impl JobController {
    pub fn new(
        config: PipelineConfig,
        provider: Arc<dyn DataProvider>,
        cache: Arc<RangeCache>,
        features: Arc<dyn FeatureProcessor>,
        store: Arc<dyn ProfileStore>,
        clock: Arc<dyn Clock>,
        events: Sender<PipelineEvent>,
    ) -> Self {
        let last_options = RunOptions::from_settings(&config.pipeline);
        Self {
            config,
            provider,
            cache,
            features,
            store,
            clock,
            events,
            table: Arc::new(Mutex::new(RunTable::idle())),
            active: None,
            last_options,
        }
    }

    pub fn handle(&self) -> ControlHandle {
        ControlHandle {
            table: self.table.clone(),
            events: self.events.clone(),
        }
    }

    pub fn status(&self) -> PipelineStatus {
        self.table.lock().status()
    }

    /// Whether a submitted run has not yet reached its end.
    pub fn is_running(&self) -> bool {
        self.active.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Start one job per distinct symbol. Returns the number of jobs.
    pub fn submit<S: AsRef<str>>(
        &mut self,
        symbols: &[S],
        options: RunOptions,
    ) -> Result<usize, ControllerError> {
        if self.is_running() {
            return Err(ControllerError::AlreadyRunning);
        }
        if let Some(previous) = self.active.take() {
            let _ = previous.join();
        }

        let mut seen = HashSet::new();
        let symbols: Vec<String> = symbols
            .iter()
            .map(|s| normalize(s.as_ref()))
            .filter(|s| !s.is_empty() && seen.insert(s.clone()))
            .collect();
        if symbols.is_empty() {
            return Err(ControllerError::NoSymbols);
        }

        let workers = self.config.pipeline.workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("harvest-worker-{i}"))
            .build()
            .map_err(|e| ControllerError::Pool(e.to_string()))?;

        let run = Arc::new(RunFlags::new());
        let specs: Vec<JobSpec> = symbols
            .iter()
            .map(|symbol| JobSpec {
                symbol: symbol.clone(),
                flags: Arc::new(JobFlags::new()),
            })
            .collect();
        {
            let mut table = self.table.lock();
            *table = RunTable {
                state: RunState::Running,
                flags: run.clone(),
                jobs: specs
                    .iter()
                    .map(|spec| JobRecord {
                        snapshot: JobSnapshot {
                            symbol: spec.symbol.clone(),
                            status: JobStatus::Queued,
                            progress: 0.0,
                            stage: "queued".into(),
                            data_points: 0,
                            api_calls: 0,
                            started_at: None,
                            duration_secs: None,
                            message: None,
                        },
                        flags: spec.flags.clone(),
                    })
                    .collect(),
                counters: Counters::default(),
                metrics: None,
            };
        }

        let total = specs.len();
        let ctx = Arc::new(WorkerContext {
            jobs: specs,
            next: AtomicUsize::new(0),
            run: run.clone(),
            options: options.clone(),
            max_consecutive_empty: self.config.pipeline.max_consecutive_empty,
            worker_limits: self.config.worker_rate_limit(),
            retry: RetryPolicy::from_config(
                &self.config.rate_limit,
                self.config.pipeline.retry_attempts,
            ),
            provider: self.provider.clone(),
            cache: self.cache.clone(),
            features: self.features.clone(),
            store: self.store.clone(),
            clock: self.clock.clone(),
        });

        let (tx, rx) = mpsc::channel();
        for worker in 0..workers.min(total) {
            let ctx = ctx.clone();
            let tx = tx.clone();
            pool.spawn(move || worker_loop(worker, ctx, tx));
        }
        drop(tx);

        info!(total, workers, mode = ?options.mode, "pipeline started");
        let _ = self.events.send(PipelineEvent::PipelineStarted { total, workers });

        let coordinator = Coordinator {
            table: self.table.clone(),
            events: self.events.clone(),
            rx,
            run,
            clock: self.clock.clone(),
            interval: self.config.pipeline.metrics_interval(),
            total,
            workers,
            started: Instant::now(),
            _pool: pool,
        };
        let handle = thread::Builder::new()
            .name("harvest-coordinator".into())
            .spawn(move || coordinator.run())
            .map_err(ControllerError::Spawn)?;

        self.active = Some(handle);
        self.last_options = options;
        Ok(total)
    }

    /// Block until the current run reaches its end.
    pub fn wait(&mut self) -> Result<RunSummary, ControllerError> {
        let handle = self.active.take().ok_or(ControllerError::NotRunning)?;
        handle.join().map_err(|_| ControllerError::CoordinatorPanicked)
    }

    /// Resubmit the failed symbols of the finished run. Returns how many.
    pub fn retry_failed(&mut self) -> Result<usize, ControllerError> {
        if self.is_running() {
            return Err(ControllerError::RunActive("retry failed jobs"));
        }
        let failed: Vec<String> = self
            .table
            .lock()
            .jobs
            .iter()
            .filter(|j| j.snapshot.status == JobStatus::Failed)
            .map(|j| j.snapshot.symbol.clone())
            .collect();
        if failed.is_empty() {
            return Ok(0);
        }
        info!(count = failed.len(), "retrying failed jobs");
        self.submit(&failed, self.last_options.clone())
    }

    /// Forget the finished run.
    pub fn clear(&mut self) -> Result<(), ControllerError> {
        if self.is_running() {
            return Err(ControllerError::RunActive("clear"));
        }
        if let Some(previous) = self.active.take() {
            let _ = previous.join();
        }
        *self.table.lock() = RunTable::idle();
        info!("pipeline cleared");
        let _ = self.events.send(PipelineEvent::PipelineCleared);
        Ok(())
    }
}

// ── Coordinator ──────────────────────────────────────────────────────

struct Coordinator {
    table: Arc<Mutex<RunTable>>,
    events: Sender<PipelineEvent>,
    rx: Receiver<WorkerMsg>,
    run: Arc<RunFlags>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    total: usize,
    workers: usize,
    started: Instant,
    // Dropped only after every worker has hung up.
    _pool: rayon::ThreadPool,
}

impl Coordinator {
    fn run(self) -> RunSummary {
        let mut metrics = MetricsAggregator::new(self.total);
        let mut limits: Vec<Option<RateLimitSnapshot>> = vec![None; self.workers];
        let mut next_tick = Instant::now() + self.interval;

        loop {
            let wait = next_tick.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(wait) {
                Ok(msg) => self.apply(msg, &mut metrics, &mut limits),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if Instant::now() >= next_tick {
                self.tick(&metrics, &limits);
                next_tick = Instant::now() + self.interval;
            }
        }
        self.finish(&mut metrics, &limits)
    }

    fn apply(
        &self,
        msg: WorkerMsg,
        metrics: &mut MetricsAggregator,
        limits: &mut [Option<RateLimitSnapshot>],
    ) {
        match msg {
            WorkerMsg::Started { index } => {
                let mut table = self.table.lock();
                let status = table.jobs.get(index).map(|j| table.live_status(j));
                let Some(job) = table.jobs.get_mut(index) else {
                    return;
                };
                job.snapshot.status = status.unwrap_or(JobStatus::Running);
                job.snapshot.started_at = Some(self.clock.now());
                job.snapshot.stage = "starting".into();
                let symbol = job.snapshot.symbol.clone();
                drop(table);

                metrics.job_started();
                let _ = self.events.send(PipelineEvent::JobStarted { symbol });
            }
            WorkerMsg::Progress { index, update } => {
                let mut table = self.table.lock();
                let status = table.jobs.get(index).map(|j| table.live_status(j));
                if let Some(job) = table.jobs.get_mut(index) {
                    if job.snapshot.status.is_terminal() {
                        return;
                    }
                    job.snapshot.status = if update.paused {
                        JobStatus::Paused
                    } else {
                        status.unwrap_or(JobStatus::Running)
                    };
                    job.snapshot.progress = update.percent;
                    job.snapshot.stage = update.stage.clone();
                    job.snapshot.data_points = update.data_points;
                    job.snapshot.api_calls = update.api_calls;
                }
                drop(table);
                let _ = self.events.send(PipelineEvent::Progress(update));
            }
            WorkerMsg::Finished { index, outcome } => {
                let event = self.record_outcome(index, &outcome);
                metrics.job_finished(outcome.status, outcome.ran);
                if let Some(event) = event {
                    let _ = self.events.send(event);
                }
            }
            WorkerMsg::Limits { worker, snapshot } => {
                if let Some(slot) = limits.get_mut(worker) {
                    *slot = Some(snapshot);
                }
            }
        }
    }

    fn record_outcome(&self, index: usize, outcome: &JobOutcome) -> Option<PipelineEvent> {
        let mut table = self.table.lock();
        let job = table.jobs.get_mut(index)?;
        let snap = &mut job.snapshot;
        snap.status = outcome.status;
        snap.message = outcome.message.clone();
        snap.data_points = outcome.data_points;
        snap.api_calls = outcome.api_calls;
        snap.duration_secs = outcome.ran.map(|d| d.as_secs_f64());
        snap.stage = outcome.status.as_str().to_string();
        if outcome.status == JobStatus::Completed {
            snap.progress = 100.0;
        }
        let symbol = snap.symbol.clone();

        let counters = &mut table.counters;
        counters.total_api_calls += outcome.api_calls as u64;
        let reason = outcome.message.clone().unwrap_or_default();
        let event = match outcome.status {
            JobStatus::Completed => {
                counters.completed += 1;
                PipelineEvent::JobCompleted {
                    symbol,
                    data_points: outcome.data_points,
                    api_calls: outcome.api_calls,
                    duration_secs: outcome.ran.map_or(0.0, |d| d.as_secs_f64()),
                    message: outcome.message.clone(),
                }
            }
            JobStatus::Failed => {
                counters.failed += 1;
                error!(symbol = %symbol, error = %reason, "job failed");
                PipelineEvent::JobFailed {
                    symbol,
                    error: reason,
                }
            }
            JobStatus::Skipped => {
                counters.skipped += 1;
                info!(symbol = %symbol, reason = %reason, "job skipped");
                PipelineEvent::JobSkipped { symbol, reason }
            }
            JobStatus::Cancelled => {
                counters.cancelled += 1;
                warn!(symbol = %symbol, reason = %reason, "job cancelled");
                PipelineEvent::JobCancelled { symbol, reason }
            }
            JobStatus::Queued | JobStatus::Running | JobStatus::Paused => return None,
        };
        Some(event)
    }

    fn tick(&self, metrics: &MetricsAggregator, limits: &[Option<RateLimitSnapshot>]) {
        let snapshot = metrics.snapshot(self.started.elapsed());
        info!(
            done = metrics.finished(),
            total = self.total,
            eta = %snapshot.eta_text,
            per_min = snapshot.throughput_per_min,
            "pipeline progress"
        );
        self.table.lock().metrics = Some(snapshot.clone());
        let _ = self.events.send(PipelineEvent::Metrics(snapshot));

        let usage = RateLimitUsage::aggregate(limits.iter().flatten());
        if usage.workers > 0 {
            let _ = self.events.send(PipelineEvent::RateLimitUsage(usage));
        }
    }

    fn finish(
        &self,
        metrics: &mut MetricsAggregator,
        limits: &[Option<RateLimitSnapshot>],
    ) -> RunSummary {
        let stopped = self.run.is_cancelled();
        let mut table = self.table.lock();
        let mut unprocessed = Vec::new();
        for job in &mut table.jobs {
            if !job.snapshot.status.is_terminal() {
                job.snapshot.status = JobStatus::Skipped;
                job.snapshot.message = Some("not processed".into());
                unprocessed.push(job.snapshot.symbol.clone());
            }
        }
        table.counters.skipped += unprocessed.len();
        for _ in &unprocessed {
            metrics.job_finished(JobStatus::Skipped, None);
        }

        let snapshot = metrics.snapshot(self.started.elapsed());
        table.metrics = Some(snapshot.clone());
        table.state = RunState::Finished;
        let c = table.counters.clone();
        drop(table);

        let summary = RunSummary {
            completed: c.completed,
            failed: c.failed,
            skipped: c.skipped,
            cancelled: c.cancelled,
            duration: self.started.elapsed(),
            total_api_calls: c.total_api_calls,
            stopped,
        };
        info!(
            completed = summary.completed,
            failed = summary.failed,
            skipped = summary.skipped,
            cancelled = summary.cancelled,
            api_calls = summary.total_api_calls,
            stopped,
            "pipeline finished"
        );

        let _ = self.events.send(PipelineEvent::Metrics(snapshot));
        let usage = RateLimitUsage::aggregate(limits.iter().flatten());
        if usage.workers > 0 {
            let _ = self.events.send(PipelineEvent::RateLimitUsage(usage));
        }
        let _ = self.events.send(if stopped {
            PipelineEvent::PipelineStopped(summary.clone())
        } else {
            PipelineEvent::PipelineCompleted(summary.clone())
        });
        summary
    }
}
