//! Data acquisition: provider, rate limiting, segment cache, and fetcher.

pub mod cache;
pub mod eodhd;
pub mod fetch;
pub mod provider;
pub mod rate_limit;

pub use cache::{CacheConfig, CacheEntry, CacheStats, PutOutcome, RangeCache};
pub use eodhd::{EodhdConfig, EodhdProvider};
pub use fetch::{FetchError, FetchOutcome, FetchSource, Fetcher, RetryPolicy};
pub use provider::{merge_bars, range_bounds, Bar, DataError, DataProvider};
pub use rate_limit::{RateLimitConfig, RateLimitSnapshot, RateLimiter};
