//! Cache-first, rate-limited range fetching.
//!
//! A `Fetcher` belongs to exactly one worker and owns that worker's
//! `RateLimiter`. The cache is shared. Each remote attempt is preceded by a
//! cooperative checkpoint and a limiter acquire, so pause and cancel are
//! observed before every network call.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use thiserror::Error;
use tracing::{debug, warn};

use super::cache::RangeCache;
use super::provider::{merge_bars, Bar, DataError, DataProvider};
use super::rate_limit::{RateLimitConfig, RateLimiter};
use crate::control::{Interrupt, JobToken};

/// How many times one range is attempted and the backoff parameters fed to
/// the limiter on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RateLimitConfig, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: config.initial_retry_delay(),
            max_delay: config.max_retry_delay(),
        }
    }
}

/// Where the returned rows came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    Cache,
    Remote,
}

#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub bars: Vec<Bar>,
    pub source: FetchSource,
    /// Remote calls made for this range, failed attempts included.
    pub api_calls: u32,
    /// The provider does not know the symbol.
    pub not_found: bool,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch interrupted ({0:?})")]
    Interrupted(Interrupt),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: DataError },

    #[error("{0}")]
    Fatal(DataError),
}

pub struct Fetcher {
    limiter: RateLimiter,
    provider: Arc<dyn DataProvider>,
    cache: Arc<RangeCache>,
    retry: RetryPolicy,
}

impl Fetcher {
    pub fn new(
        limiter: RateLimiter,
        provider: Arc<dyn DataProvider>,
        cache: Arc<RangeCache>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            limiter,
            provider,
            cache,
            retry,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Bars for `symbol` in `[from, to)`.
    ///
    /// Fully cached ranges never touch the network. Otherwise the provider is
    /// called (with retries), the new segment is cached once its last day is
    /// over, and remote rows are merged with whatever the cache already held.
    pub fn fetch_range(
        &mut self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
        token: &JobToken,
    ) -> Result<FetchOutcome, FetchError> {
        if from >= to {
            return Ok(FetchOutcome {
                bars: Vec::new(),
                source: FetchSource::Cache,
                api_calls: 0,
                not_found: false,
            });
        }

        if self.cache.is_covered(symbol, from, to) {
            if let Some(bars) = self.cache.get(symbol, from, to) {
                debug!(symbol, %from, %to, rows = bars.len(), "range served from cache");
                return Ok(FetchOutcome {
                    bars,
                    source: FetchSource::Cache,
                    api_calls: 0,
                    not_found: false,
                });
            }
        }
        let cached = self.cache.get(symbol, from, to).unwrap_or_default();

        let attempts = self.retry.max_attempts.max(1);
        let mut api_calls = 0;
        let mut last = None;
        for attempt in 1..=attempts {
            token.checkpoint().map_err(FetchError::Interrupted)?;
            self.limiter
                .acquire_interruptible(token)
                .map_err(FetchError::Interrupted)?;
            api_calls += 1;

            match self.provider.fetch(symbol, from, to) {
                Ok(remote) => {
                    self.limiter.on_success();
                    if !self.cache.is_settled(to) {
                        debug!(symbol, %from, %to, "segment reaches past today, not cached");
                    } else if let Err(e) = self.cache.put(symbol, from, to, &remote) {
                        warn!(symbol, error = %e, "failed to cache segment");
                    }
                    let mut combined = remote;
                    combined.extend(cached);
                    return Ok(FetchOutcome {
                        bars: merge_bars(combined, from, to),
                        source: FetchSource::Remote,
                        api_calls,
                        not_found: false,
                    });
                }
                Err(DataError::SymbolNotFound { .. }) => {
                    warn!(symbol, provider = self.provider.name(), "symbol not found");
                    return Ok(FetchOutcome {
                        bars: Vec::new(),
                        source: FetchSource::Remote,
                        api_calls,
                        not_found: true,
                    });
                }
                Err(DataError::QuotaExceeded) => {
                    self.limiter
                        .on_quota_exceeded(self.retry.initial_delay, self.retry.max_delay);
                    warn!(symbol, attempt, "provider quota exceeded");
                    last = Some(DataError::QuotaExceeded);
                }
                Err(e) if e.is_transient() => {
                    self.limiter
                        .on_error(self.retry.initial_delay, self.retry.max_delay);
                    warn!(symbol, attempt, error = %e, "transient fetch error");
                    last = Some(e);
                }
                Err(e) => return Err(FetchError::Fatal(e)),
            }
        }

        Err(FetchError::Exhausted {
            attempts,
            last: last.unwrap_or_else(|| DataError::Network("no attempt completed".into())),
        })
    }
}
