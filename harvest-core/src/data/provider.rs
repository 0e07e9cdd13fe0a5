//! Remote provider trait and structured error types.
//!
//! The DataProvider trait abstracts over the remote time-series API so the
//! fetcher can be driven by the real HTTP provider or by a scripted mock in
//! tests. A provider performs exactly one request per call; retries, backoff
//! and caching live above it in the fetcher.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One OHLCV record. `timestamp` is unix seconds (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

/// Structured error types for data operations.
///
/// `is_transient()` drives the retry policy: quota, network, server and
/// malformed-body errors are retried; an unknown symbol is terminal.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("quota exceeded by provider (HTTP 429)")]
    QuotaExceeded,

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("network unreachable: {0}")]
    Network(String),

    #[error("server error: HTTP {status}")]
    Server { status: u16 },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("cache error: {0}")]
    Cache(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("parquet I/O error: {0}")]
    Parquet(String),
}

impl DataError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DataError::QuotaExceeded
                | DataError::Timeout(_)
                | DataError::Network(_)
                | DataError::Server { .. }
                | DataError::Malformed(_)
        )
    }
}

/// Trait for remote time-series providers.
pub trait DataProvider: Send + Sync {
    /// Human-readable name of this provider.
    fn name(&self) -> &str;

    /// Fetch bars for `symbol` in the half-open date range `[from, to)`.
    ///
    /// An empty vector means the provider answered but had no rows.
    fn fetch(&self, symbol: &str, from: NaiveDate, to: NaiveDate) -> Result<Vec<Bar>, DataError>;
}

/// Unix-second bounds `[start, end)` of the half-open date range `[from, to)`.
pub fn range_bounds(from: NaiveDate, to: NaiveDate) -> (i64, i64) {
    let start = from.and_hms_opt(0, 0, 0).map_or(0, |dt| dt.and_utc().timestamp());
    let end = to.and_hms_opt(0, 0, 0).map_or(0, |dt| dt.and_utc().timestamp());
    (start, end)
}

/// Keep bars inside `[from, to)`, sort ascending and drop duplicate timestamps.
///
/// When two bars share a timestamp the first one encountered wins, so callers
/// pass fresher data first.
pub fn merge_bars(bars: Vec<Bar>, from: NaiveDate, to: NaiveDate) -> Vec<Bar> {
    let (start, end) = range_bounds(from, to);
    let mut kept: Vec<Bar> = bars
        .into_iter()
        .filter(|b| b.timestamp >= start && b.timestamp < end)
        .collect();
    // Stable sort keeps the first occurrence ahead of later duplicates.
    kept.sort_by_key(|b| b.timestamp);
    kept.dedup_by_key(|b| b.timestamp);
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(ts: i64, close: f64) -> Bar {
        Bar {
            timestamp: ts,
            open: close,
            high: close,
            low: close,
            close,
            volume: 10,
        }
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn transient_classification() {
        assert!(DataError::QuotaExceeded.is_transient());
        assert!(DataError::Server { status: 503 }.is_transient());
        assert!(DataError::Malformed("x".into()).is_transient());
        assert!(!DataError::SymbolNotFound { symbol: "X".into() }.is_transient());
        assert!(!DataError::Cache("x".into()).is_transient());
    }

    #[test]
    fn range_bounds_are_midnight_utc() {
        let (start, end) = range_bounds(day(2024, 1, 1), day(2024, 1, 2));
        assert_eq!(start, 1_704_067_200);
        assert_eq!(end - start, 86_400);
    }

    #[test]
    fn merge_filters_sorts_and_dedups() {
        let (start, end) = range_bounds(day(2024, 1, 1), day(2024, 1, 2));
        let bars = vec![
            bar(start + 120, 3.0),
            bar(start + 60, 2.0),
            bar(start + 60, 99.0),
            bar(end, 4.0),
            bar(start - 1, 0.0),
        ];
        let merged = merge_bars(bars, day(2024, 1, 1), day(2024, 1, 2));
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].timestamp, start + 60);
        assert_eq!(merged[0].close, 2.0);
        assert_eq!(merged[1].timestamp, start + 120);
    }
}
