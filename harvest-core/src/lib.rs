//! Harvest Core: the fetch side of the pipeline.
//!
//! This crate contains everything needed to pull time-series bars for one
//! symbol without hammering the remote API:
//! - Domain bar type and structured data errors
//! - Remote provider trait plus the EODHD intraday HTTP provider
//! - Per-worker rate limiter (minute window, day quota, backoff)
//! - Range-aware segment cache with a self-healing manifest
//! - Cooperative pause/cancel tokens checked at every I/O boundary
//! - The fetcher that ties cache, limiter, and provider together

pub mod clock;
pub mod control;
pub mod data;

pub use clock::{Clock, ManualClock, SystemClock};
pub use control::{Interrupt, JobFlags, JobToken, RunFlags};
pub use data::{
    Bar, CacheConfig, CacheEntry, CacheStats, DataError, DataProvider, EodhdConfig,
    EodhdProvider, FetchError, FetchOutcome, FetchSource, Fetcher, PutOutcome, RangeCache,
    RateLimitConfig, RateLimitSnapshot, RateLimiter, RetryPolicy,
};
