//! Fetcher integration: scripted provider, injectable clock, shared cache.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{NaiveDate, TimeZone, Utc};
use harvest_core::data::range_bounds;
use harvest_core::{
    Bar, CacheConfig, Clock, DataError, DataProvider, FetchSource, Fetcher, JobToken,
    ManualClock, RangeCache, RateLimiter, RetryPolicy, SystemClock,
};

/// Answers every request with one bar per hour of the requested range.
struct Hourly {
    calls: AtomicUsize,
}

impl Hourly {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

impl DataProvider for Hourly {
    fn name(&self) -> &str {
        "hourly"
    }

    fn fetch(&self, _: &str, from: NaiveDate, to: NaiveDate) -> Result<Vec<Bar>, DataError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (start, end) = range_bounds(from, to);
        Ok((start..end)
            .step_by(3600)
            .map(|ts| Bar {
                timestamp: ts,
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                volume: 1,
            })
            .collect())
    }
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 4, d).unwrap()
}

#[test]
fn fourth_call_waits_for_day_rollover() {
    let tmp = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
    ));
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let cache = Arc::new(RangeCache::open(CacheConfig::new(tmp.path()), dyn_clock.clone()).unwrap());
    let limiter = RateLimiter::new(100, 3, dyn_clock);
    let reset_at = limiter.next_reset();
    let provider = Hourly::new();
    let mut fetcher = Fetcher::new(limiter, provider.clone(), cache, RetryPolicy::default());
    let token = JobToken::detached();

    for d in 1..=3 {
        let out = fetcher.fetch_range("SPY", day(d), day(d + 1), &token).unwrap();
        assert_eq!(out.source, FetchSource::Remote);
    }
    assert_eq!(clock.total_slept(), Duration::ZERO);

    // A cache hit does not need a permit.
    let hit = fetcher.fetch_range("SPY", day(1), day(3), &token).unwrap();
    assert_eq!(hit.source, FetchSource::Cache);
    assert_eq!(clock.now(), reset_at - chrono::Duration::days(1));

    fetcher.fetch_range("SPY", day(4), day(5), &token).unwrap();
    assert_eq!(clock.now(), reset_at);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
    assert_eq!(fetcher.limiter().daily_calls(), 1);
}

#[test]
fn workers_share_one_cache_safely() {
    let tmp = tempfile::tempdir().unwrap();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cache = Arc::new(RangeCache::open(CacheConfig::new(tmp.path()), clock.clone()).unwrap());
    let provider = Hourly::new();

    let handles: Vec<_> = ["AAA", "BBB", "CCC", "DDD"]
        .into_iter()
        .map(|symbol| {
            let mut fetcher = Fetcher::new(
                RateLimiter::new(1000, 1000, clock.clone()),
                provider.clone(),
                cache.clone(),
                RetryPolicy::default(),
            );
            thread::spawn(move || {
                let token = JobToken::detached();
                for d in 1..=5 {
                    fetcher.fetch_range(symbol, day(d), day(d + 1), &token).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(cache.stats().entries, 20);
    drop(cache);

    let reopened = RangeCache::open(CacheConfig::new(tmp.path()), clock).unwrap();
    assert_eq!(reopened.stats().entries, 20);
    assert_eq!(reopened.stats().degraded, 0);
    for symbol in ["AAA", "BBB", "CCC", "DDD"] {
        assert!(reopened.is_covered(symbol, day(1), day(6)));
    }
}
