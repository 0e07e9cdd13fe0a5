//! Worker side of a run: claim jobs, run each symbol end-to-end, report.
//!
//! Each pool worker owns one `Fetcher` (and so one rate budget) for the
//! whole run. Jobs are claimed from the submitted list with a single atomic
//! counter. Workers never touch the status table; everything goes to the
//! coordinator as `WorkerMsg`s.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Days, NaiveDate, Utc};
use harvest_core::data::merge_bars;
use harvest_core::{
    Bar, Clock, DataProvider, FetchError, Fetcher, Interrupt, JobFlags, JobToken, RangeCache,
    RateLimitConfig, RateLimitSnapshot, RateLimiter, RetryPolicy, RunFlags,
};
use tracing::{debug, error, info, warn};

use crate::collaborators::{CollaboratorError, FeatureProcessor, FeatureSet, Profile, ProfileStore};
use crate::config::FetchMode;
use crate::controller::{JobStatus, RunOptions};
use crate::events::ProgressUpdate;

pub(crate) struct JobSpec {
    pub symbol: String,
    pub flags: Arc<JobFlags>,
}

pub(crate) struct JobOutcome {
    pub status: JobStatus,
    pub message: Option<String>,
    pub data_points: usize,
    pub api_calls: u32,
    /// `None` for jobs that never started.
    pub ran: Option<Duration>,
}

pub(crate) enum WorkerMsg {
    Started { index: usize },
    Progress { index: usize, update: ProgressUpdate },
    Finished { index: usize, outcome: JobOutcome },
    Limits { worker: usize, snapshot: RateLimitSnapshot },
}

/// Everything a worker needs, shared read-only across the pool.
pub(crate) struct WorkerContext {
    pub jobs: Vec<JobSpec>,
    pub next: AtomicUsize,
    pub run: Arc<RunFlags>,
    pub options: RunOptions,
    pub max_consecutive_empty: u32,
    pub worker_limits: RateLimitConfig,
    pub retry: RetryPolicy,
    pub provider: Arc<dyn DataProvider>,
    pub cache: Arc<RangeCache>,
    pub features: Arc<dyn FeatureProcessor>,
    pub store: Arc<dyn ProfileStore>,
    pub clock: Arc<dyn Clock>,
}

enum JobError {
    Interrupted(Interrupt),
    Fetch(FetchError),
    Collaborator(CollaboratorError),
}

impl From<Interrupt> for JobError {
    fn from(i: Interrupt) -> Self {
        JobError::Interrupted(i)
    }
}

impl From<FetchError> for JobError {
    fn from(e: FetchError) -> Self {
        match e {
            FetchError::Interrupted(i) => JobError::Interrupted(i),
            other => JobError::Fetch(other),
        }
    }
}

impl From<CollaboratorError> for JobError {
    fn from(e: CollaboratorError) -> Self {
        JobError::Collaborator(e)
    }
}

/// Body of one pool worker. Returns when the job list is exhausted.
pub(crate) fn worker_loop(worker: usize, ctx: Arc<WorkerContext>, tx: Sender<WorkerMsg>) {
    let limiter = RateLimiter::from_config(&ctx.worker_limits, ctx.clock.clone());
    let mut fetcher = Fetcher::new(limiter, ctx.provider.clone(), ctx.cache.clone(), ctx.retry);
    debug!(worker, "worker started");
    send_limits(&tx, worker, &fetcher);

    loop {
        let index = ctx.next.fetch_add(1, Ordering::SeqCst);
        let Some(spec) = ctx.jobs.get(index) else {
            break;
        };

        let outcome = if ctx.run.is_cancelled() {
            not_started(JobStatus::Skipped, "pipeline stopped")
        } else if spec.flags.is_cancelled() {
            not_started(JobStatus::Cancelled, "cancelled before start")
        } else if spec.flags.is_skipped() {
            not_started(JobStatus::Skipped, "skipped by operator")
        } else {
            let _ = tx.send(WorkerMsg::Started { index });
            run_one(&ctx, worker, index, spec, &mut fetcher, &tx)
        };

        let _ = tx.send(WorkerMsg::Finished { index, outcome });
        send_limits(&tx, worker, &fetcher);
    }
    debug!(worker, "worker idle, no jobs left");
}

fn send_limits(tx: &Sender<WorkerMsg>, worker: usize, fetcher: &Fetcher) {
    let _ = tx.send(WorkerMsg::Limits {
        worker,
        snapshot: fetcher.limiter().snapshot(),
    });
}

fn not_started(status: JobStatus, reason: &str) -> JobOutcome {
    JobOutcome {
        status,
        message: Some(reason.to_string()),
        data_points: 0,
        api_calls: 0,
        ran: None,
    }
}

fn run_one(
    ctx: &WorkerContext,
    worker: usize,
    index: usize,
    spec: &JobSpec,
    fetcher: &mut Fetcher,
    tx: &Sender<WorkerMsg>,
) -> JobOutcome {
    let mut job = SymbolJob {
        ctx,
        worker,
        index,
        symbol: &spec.symbol,
        token: JobToken::new(ctx.run.clone(), spec.flags.clone()),
        tx,
        started: Instant::now(),
        percent: 0.0,
        stage: String::new(),
        data_points: 0,
        api_calls: 0,
    };
    info!(symbol = %spec.symbol, "job started");

    let result = catch_unwind(AssertUnwindSafe(|| job.run(fetcher)));
    let (status, message) = match result {
        Ok(Ok(done)) => done,
        Ok(Err(JobError::Interrupted(Interrupt::Cancelled))) => {
            (JobStatus::Cancelled, Some("cancelled by operator".to_string()))
        }
        Ok(Err(JobError::Interrupted(Interrupt::Skipped))) => {
            (JobStatus::Skipped, Some("skipped by operator".to_string()))
        }
        Ok(Err(JobError::Interrupted(Interrupt::Stopped))) => {
            (JobStatus::Cancelled, Some("pipeline stopped".to_string()))
        }
        Ok(Err(JobError::Fetch(e))) => (JobStatus::Failed, Some(e.to_string())),
        Ok(Err(JobError::Collaborator(e))) => (JobStatus::Failed, Some(e.to_string())),
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(symbol = %spec.symbol, panic = %msg, "job panicked");
            (JobStatus::Failed, Some(format!("job panicked: {msg}")))
        }
    };

    JobOutcome {
        status,
        message,
        data_points: job.data_points,
        api_calls: job.api_calls,
        ran: Some(job.started.elapsed()),
    }
}

/// One symbol, end-to-end: profile lookup, chunked fetch, features, store.
struct SymbolJob<'a> {
    ctx: &'a WorkerContext,
    worker: usize,
    index: usize,
    symbol: &'a str,
    token: JobToken,
    tx: &'a Sender<WorkerMsg>,
    started: Instant,
    percent: f64,
    stage: String,
    data_points: usize,
    api_calls: u32,
}

type Done = (JobStatus, Option<String>);

impl SymbolJob<'_> {
    fn run(&mut self, fetcher: &mut Fetcher) -> Result<Done, JobError> {
        self.progress(0.0, "starting");
        self.checkpoint()?;

        let existing = self.ctx.store.get(self.symbol)?;
        self.progress(10.0, "checking stored profile");

        let today = self.ctx.clock.now().date_naive();
        let end = today.checked_add_days(Days::new(1)).unwrap_or(today);
        let incremental = match (&existing, self.ctx.options.mode) {
            (Some(profile), FetchMode::Incremental) => Some(profile),
            _ => None,
        };

        let (floor, max_empty) = match incremental {
            Some(profile) => (date_of(profile.last_timestamp).unwrap_or(profile.data_end), u32::MAX),
            None => (
                end.checked_sub_days(Days::new(self.ctx.options.max_history_days as u64))
                    .unwrap_or(NaiveDate::MIN),
                self.ctx.max_consecutive_empty.max(1),
            ),
        };

        let fetched = self.fetch_chunks(fetcher, floor, end, max_empty)?;
        let bars = match (fetched, incremental) {
            (Fetched::NotFound, _) => {
                warn!(symbol = self.symbol, "unknown symbol, skipping");
                return Ok((JobStatus::Skipped, Some("symbol not found".into())));
            }
            (Fetched::Bars(bars), Some(profile)) => {
                let new: Vec<Bar> = bars
                    .into_iter()
                    .filter(|b| b.timestamp > profile.last_timestamp)
                    .collect();
                if new.is_empty() {
                    info!(symbol = self.symbol, "no new data since last run");
                    self.progress(100.0, "up to date");
                    return Ok((JobStatus::Completed, Some("no new data".into())));
                }
                new
            }
            (Fetched::Bars(bars), None) if bars.is_empty() => {
                warn!(symbol = self.symbol, "no data available, skipping");
                return Ok((JobStatus::Skipped, Some("no data available".into())));
            }
            (Fetched::Bars(bars), None) => bars,
        };
        self.data_points = bars.len();

        self.checkpoint()?;
        self.progress(50.0, "computing features");
        let mut features = self.ctx.features.process(self.symbol, &bars)?;
        if let Some(profile) = incremental {
            features = self.ctx.features.merge(&profile.features, features);
        }

        self.checkpoint()?;
        self.progress(70.0, "building profile");
        let profile = self.build_profile(&bars, incremental, features);

        self.checkpoint()?;
        self.progress(90.0, "storing profile");
        self.ctx.store.save(&profile)?;

        self.progress(100.0, "done");
        info!(
            symbol = self.symbol,
            rows = self.data_points,
            api_calls = self.api_calls,
            "job completed"
        );
        Ok((JobStatus::Completed, None))
    }

    /// Walk backwards from `end` to `floor` in `chunk_days` windows, stopping
    /// early after `max_empty` empty chunks in a row.
    fn fetch_chunks(
        &mut self,
        fetcher: &mut Fetcher,
        floor: NaiveDate,
        end: NaiveDate,
        max_empty: u32,
    ) -> Result<Fetched, JobError> {
        let chunk = Days::new(self.ctx.options.chunk_days.max(1) as u64);
        let span = (end - floor).num_days().max(1) as f64;
        let mut cursor = end;
        let mut empty_run = 0u32;
        let mut collected = Vec::new();

        while cursor > floor && empty_run < max_empty {
            self.checkpoint()?;
            let start = cursor.checked_sub_days(chunk).unwrap_or(floor).max(floor);
            self.stage = format!("fetching {start}..{cursor}");

            let out = fetcher.fetch_range(self.symbol, start, cursor, &self.token);
            send_limits(self.tx, self.worker, fetcher);
            let out = out?;
            self.api_calls += out.api_calls;
            if out.not_found {
                return Ok(Fetched::NotFound);
            }
            if out.bars.is_empty() {
                empty_run += 1;
                debug!(symbol = self.symbol, %start, %cursor, empty_run, "empty chunk");
            } else {
                empty_run = 0;
                collected.extend(out.bars);
            }
            self.data_points = collected.len();

            cursor = start;
            let done = (end - cursor).num_days() as f64 / span;
            let stage = self.stage.clone();
            self.progress(10.0 + 40.0 * done.min(1.0), &stage);
        }
        if empty_run >= max_empty && cursor > floor {
            info!(symbol = self.symbol, earliest = %cursor, "history discovery stopped at empty chunks");
        }

        Ok(Fetched::Bars(merge_bars(collected, floor, end)))
    }

    fn build_profile(
        &self,
        bars: &[Bar],
        previous: Option<&Profile>,
        features: FeatureSet,
    ) -> Profile {
        let first = bars.first().map_or(0, |b| b.timestamp);
        let last = bars.last().map_or(0, |b| b.timestamp);
        let first_date = date_of(first).unwrap_or(NaiveDate::MIN);
        let last_date = date_of(last).unwrap_or(NaiveDate::MIN);
        let now = self.ctx.clock.now();

        match previous {
            Some(p) => Profile {
                symbol: self.symbol.to_string(),
                data_start: p.data_start.min(first_date),
                data_end: p.data_end.max(last_date),
                last_timestamp: p.last_timestamp.max(last),
                data_points: p.data_points + bars.len(),
                features,
                updated_at: now,
            },
            None => Profile {
                symbol: self.symbol.to_string(),
                data_start: first_date,
                data_end: last_date,
                last_timestamp: last,
                data_points: bars.len(),
                features,
                updated_at: now,
            },
        }
    }

    /// Block while paused (reporting the pause), then surface any interrupt.
    fn checkpoint(&self) -> Result<(), Interrupt> {
        self.token.checkpoint_with(|paused| self.send_progress(paused))
    }

    fn progress(&mut self, percent: f64, stage: &str) {
        self.percent = percent;
        self.stage = stage.to_string();
        self.send_progress(false);
    }

    fn send_progress(&self, paused: bool) {
        let _ = self.tx.send(WorkerMsg::Progress {
            index: self.index,
            update: ProgressUpdate {
                symbol: self.symbol.to_string(),
                percent: self.percent,
                stage: if paused {
                    "paused".to_string()
                } else {
                    self.stage.clone()
                },
                data_points: self.data_points,
                api_calls: self.api_calls,
                elapsed_secs: self.started.elapsed().as_secs_f64(),
                paused,
            },
        });
    }
}

enum Fetched {
    Bars(Vec<Bar>),
    NotFound,
}

fn date_of(timestamp: i64) -> Option<NaiveDate> {
    DateTime::<Utc>::from_timestamp(timestamp, 0).map(|dt| dt.date_naive())
}
