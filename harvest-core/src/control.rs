//! Cooperative pause/cancel tokens.
//!
//! The controller owns one `RunFlags` per pipeline run and one `JobFlags`
//! per symbol. Workers receive a `JobToken` combining both and poll it at
//! every checkpoint: before each network call and at chunk boundaries.
//! Nothing is ever interrupted mid-call; an in-flight request finishes and
//! the job stops at the next checkpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default polling interval while a job is paused.
pub const PAUSE_POLL: Duration = Duration::from_millis(100);

/// Why a job stopped before finishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    /// The operator cancelled this job.
    Cancelled,
    /// The operator asked to skip this job.
    Skipped,
    /// The whole run was stopped.
    Stopped,
}

/// Run-wide flags shared by every job of one run.
#[derive(Debug, Default)]
pub struct RunFlags {
    paused: AtomicBool,
    cancelled: AtomicBool,
}

impl RunFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Per-symbol flags.
#[derive(Debug, Default)]
pub struct JobFlags {
    paused: AtomicBool,
    cancelled: AtomicBool,
    skipped: AtomicBool,
}

impl JobFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn skip(&self) {
        self.skipped.store(true, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped.load(Ordering::SeqCst)
    }
}

/// The view of run and job flags handed to one worker for one job.
#[derive(Debug, Clone)]
pub struct JobToken {
    run: Arc<RunFlags>,
    job: Arc<JobFlags>,
    poll: Duration,
}

impl JobToken {
    pub fn new(run: Arc<RunFlags>, job: Arc<JobFlags>) -> Self {
        Self {
            run,
            job,
            poll: PAUSE_POLL,
        }
    }

    /// A token nobody else holds; it never pauses or cancels.
    pub fn detached() -> Self {
        Self::new(Arc::new(RunFlags::new()), Arc::new(JobFlags::new()))
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// Pending interrupt, if any. Job-level requests win over a run stop.
    pub fn interrupt(&self) -> Option<Interrupt> {
        if self.job.is_cancelled() {
            Some(Interrupt::Cancelled)
        } else if self.job.is_skipped() {
            Some(Interrupt::Skipped)
        } else if self.run.is_cancelled() {
            Some(Interrupt::Stopped)
        } else {
            None
        }
    }

    pub fn is_paused(&self) -> bool {
        self.run.is_paused() || self.job.is_paused()
    }

    /// Block while paused, then report any pending interrupt.
    pub fn checkpoint(&self) -> Result<(), Interrupt> {
        self.checkpoint_with(|_| {})
    }

    /// Like `checkpoint`, calling `on_pause(true)` when the job starts waiting
    /// and `on_pause(false)` when it resumes.
    pub fn checkpoint_with(&self, mut on_pause: impl FnMut(bool)) -> Result<(), Interrupt> {
        let mut waiting = false;
        loop {
            if let Some(interrupt) = self.interrupt() {
                return Err(interrupt);
            }
            if !self.is_paused() {
                if waiting {
                    on_pause(false);
                }
                return Ok(());
            }
            if !waiting {
                waiting = true;
                on_pause(true);
            }
            std::thread::sleep(self.poll);
        }
    }
}
