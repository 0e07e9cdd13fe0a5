//! Per-worker rate limiter: sliding minute window, daily quota, backoff.
//!
//! Each worker owns one `RateLimiter` outright. The global API budget is
//! split across workers up front (`RateLimitConfig::per_worker`) with a
//! safety margin, so no limiter is ever shared and none needs a lock. The
//! cross-worker total is therefore only bounded by the division, not by a
//! shared counter.
//!
//! `acquire` never fails: sleeping is its only observable effect. The daily
//! quota rolls over 24 hours after the previous rollover (not at calendar
//! midnight).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::control::{Interrupt, JobToken};

/// Length of the sliding window.
const WINDOW: Duration = Duration::from_secs(60);
/// Extra wait after the oldest call leaves the window.
const WINDOW_MARGIN: Duration = Duration::from_millis(500);
/// Longest single sleep; interruptible waits re-check the token in between.
const SLEEP_SLICE: Duration = Duration::from_secs(1);

/// Global API budget, as configured for the whole pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub calls_per_minute: u32,
    pub calls_per_day: u64,
    pub initial_retry_delay_secs: u64,
    pub max_retry_delay_secs: u64,
    /// Fraction of the evenly divided budget each worker may use.
    pub safety_margin: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            calls_per_minute: 80,
            calls_per_day: 95_000,
            initial_retry_delay_secs: 5,
            max_retry_delay_secs: 300,
            safety_margin: 0.9,
        }
    }
}

impl RateLimitConfig {
    /// The share of this budget one of `workers` workers gets.
    ///
    /// Per-minute floor is 1 call, per-day floor is 10 calls.
    pub fn per_worker(&self, workers: usize) -> Self {
        let workers = workers.max(1) as f64;
        let minute = (self.calls_per_minute as f64 / workers * self.safety_margin).floor();
        let day = (self.calls_per_day as f64 / workers * self.safety_margin).floor();
        Self {
            calls_per_minute: (minute as u32).max(1),
            calls_per_day: (day as u64).max(10),
            ..self.clone()
        }
    }

    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_secs(self.initial_retry_delay_secs)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_secs(self.max_retry_delay_secs)
    }
}

/// Point-in-time view of one limiter, for the periodic usage event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub minute_calls: usize,
    pub minute_limit: usize,
    pub daily_calls: u64,
    pub daily_limit: u64,
    pub daily_remaining: u64,
    pub consecutive_errors: u32,
    pub current_delay_secs: f64,
    pub next_reset: DateTime<Utc>,
    pub total_calls: u64,
}

/// One worker's call budget.
pub struct RateLimiter {
    minute_limit: usize,
    daily_limit: u64,
    window: VecDeque<DateTime<Utc>>,
    daily_calls: u64,
    daily_reset_at: DateTime<Utc>,
    consecutive_errors: u32,
    current_delay: Duration,
    total_calls: u64,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(calls_per_minute: u32, calls_per_day: u64, clock: Arc<dyn Clock>) -> Self {
        let minute_limit = (calls_per_minute as usize).max(1);
        let now = clock.now();
        Self {
            minute_limit,
            daily_limit: calls_per_day.max(1),
            window: VecDeque::with_capacity(minute_limit),
            daily_calls: 0,
            daily_reset_at: now + chrono::Duration::days(1),
            consecutive_errors: 0,
            current_delay: Duration::ZERO,
            total_calls: 0,
            clock,
        }
    }

    pub fn from_config(config: &RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(config.calls_per_minute, config.calls_per_day, clock)
    }

    /// Block until one more call is allowed, then count it.
    pub fn acquire(&mut self) {
        // Without an interrupt source the wait always runs to completion.
        let _ = self.wait_for_slot(&|| None);
    }

    /// Like `acquire`, but gives up when the token reports an interrupt.
    /// No slot is consumed on interruption.
    pub fn acquire_interruptible(&mut self, token: &JobToken) -> Result<(), Interrupt> {
        self.wait_for_slot(&|| token.interrupt())
    }

    /// A call succeeded: clear backoff.
    pub fn on_success(&mut self) {
        if self.consecutive_errors > 0 {
            info!(
                errors = self.consecutive_errors,
                "API call succeeded, resetting backoff"
            );
        }
        self.consecutive_errors = 0;
        self.current_delay = Duration::ZERO;
    }

    /// A call failed: delay = min(initial * 2^errors, max), then errors += 1.
    pub fn on_error(&mut self, initial_delay: Duration, max_delay: Duration) {
        let factor = 2u32.checked_pow(self.consecutive_errors).unwrap_or(u32::MAX);
        self.current_delay = initial_delay
            .checked_mul(factor)
            .unwrap_or(max_delay)
            .min(max_delay);
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        warn!(
            errors = self.consecutive_errors,
            delay_secs = self.current_delay.as_secs_f64(),
            "API error, backing off"
        );
    }

    /// The provider rejected the call for quota reasons. Back off as for any
    /// error, and give back the daily slot: only permitted calls count.
    pub fn on_quota_exceeded(&mut self, initial_delay: Duration, max_delay: Duration) {
        self.daily_calls = self.daily_calls.saturating_sub(1);
        self.on_error(initial_delay, max_delay);
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn daily_calls(&self) -> u64 {
        self.daily_calls
    }

    pub fn total_calls(&self) -> u64 {
        self.total_calls
    }

    pub fn next_reset(&self) -> DateTime<Utc> {
        self.daily_reset_at
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        let now = self.clock.now();
        let minute_calls = self
            .window
            .iter()
            .filter(|t| age(now, **t) < WINDOW)
            .count();
        RateLimitSnapshot {
            minute_calls,
            minute_limit: self.minute_limit,
            daily_calls: self.daily_calls,
            daily_limit: self.daily_limit,
            daily_remaining: self.daily_limit.saturating_sub(self.daily_calls),
            consecutive_errors: self.consecutive_errors,
            current_delay_secs: self.current_delay.as_secs_f64(),
            next_reset: self.daily_reset_at,
            total_calls: self.total_calls,
        }
    }

    fn wait_for_slot(&mut self, interrupt: &dyn Fn() -> Option<Interrupt>) -> Result<(), Interrupt> {
        if !self.current_delay.is_zero() {
            info!(
                delay_secs = self.current_delay.as_secs_f64(),
                "waiting out backoff delay"
            );
            self.sleep_for(self.current_delay, interrupt)?;
        }

        let now = self.clock.now();
        self.roll_day(now);
        if self.daily_calls >= self.daily_limit {
            let wait = (self.daily_reset_at - now).to_std().unwrap_or(Duration::ZERO);
            warn!(
                wait_secs = wait.as_secs(),
                limit = self.daily_limit,
                "daily limit reached, sleeping until reset"
            );
            self.sleep_for(wait, interrupt)?;
            let now = self.clock.now();
            self.roll_day(now);
        }

        let now = self.clock.now();
        self.prune(now);
        if self.window.len() >= self.minute_limit {
            if let Some(&oldest) = self.window.front() {
                let wait = WINDOW.saturating_sub(age(now, oldest)) + WINDOW_MARGIN;
                debug!(wait_secs = wait.as_secs_f64(), "minute window full, sleeping");
                self.sleep_for(wait, interrupt)?;
            }
            let now = self.clock.now();
            self.prune(now);
        }

        let now = self.clock.now();
        self.window.push_back(now);
        self.daily_calls += 1;
        self.total_calls += 1;
        Ok(())
    }

    fn roll_day(&mut self, now: DateTime<Utc>) {
        if now >= self.daily_reset_at {
            self.daily_calls = 0;
            self.daily_reset_at = now + chrono::Duration::days(1);
            info!(next_reset = %self.daily_reset_at, "daily API quota reset");
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        while let Some(&oldest) = self.window.front() {
            if age(now, oldest) >= WINDOW {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn sleep_for(
        &self,
        duration: Duration,
        interrupt: &dyn Fn() -> Option<Interrupt>,
    ) -> Result<(), Interrupt> {
        let mut remaining = duration;
        while !remaining.is_zero() {
            if let Some(stop) = interrupt() {
                return Err(stop);
            }
            let step = remaining.min(SLEEP_SLICE);
            self.clock.sleep(step);
            remaining -= step;
        }
        Ok(())
    }
}

fn age(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or(Duration::ZERO)
}
