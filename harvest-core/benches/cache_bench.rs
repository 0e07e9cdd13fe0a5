//! Criterion benchmarks for the segment cache read path.
//!
//! Benchmarks:
//! 1. Coverage check across many segments (manifest walk only)
//! 2. Merged read of a multi-segment range (Parquet decode + merge)

use std::sync::Arc;

use chrono::{NaiveDate, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use harvest_core::data::range_bounds;
use harvest_core::{Bar, CacheConfig, ManualClock, RangeCache};

// ── Helpers ──────────────────────────────────────────────────────────

fn day(offset: i64) -> NaiveDate {
    NaiveDate::from_ymd_opt(2022, 1, 1).unwrap() + chrono::Duration::days(offset)
}

fn minute_bars(from: NaiveDate, to: NaiveDate) -> Vec<Bar> {
    let (start, end) = range_bounds(from, to);
    (start..end)
        .step_by(60)
        .map(|ts| {
            let close = 100.0 + ((ts / 60) as f64 * 0.01).sin();
            Bar {
                timestamp: ts,
                open: close - 0.05,
                high: close + 0.1,
                low: close - 0.1,
                close,
                volume: 1_000,
            }
        })
        .collect()
}

/// A cache holding `segments` contiguous one-day segments for "SPY".
fn populated(dir: &std::path::Path, segments: i64) -> RangeCache {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2022, 6, 1, 0, 0, 0).unwrap(),
    ));
    let cache = RangeCache::open(CacheConfig::new(dir), clock).unwrap();
    for i in 0..segments {
        cache
            .put("SPY", day(i), day(i + 1), &minute_bars(day(i), day(i + 1)))
            .unwrap();
    }
    cache
}

// ── 1. Coverage ──────────────────────────────────────────────────────

fn bench_is_covered(c: &mut Criterion) {
    let mut group = c.benchmark_group("is_covered");
    for segments in [10i64, 100] {
        let tmp = tempfile::tempdir().unwrap();
        let cache = populated(tmp.path(), segments);
        group.bench_with_input(BenchmarkId::from_parameter(segments), &segments, |b, &n| {
            b.iter(|| black_box(cache.is_covered("SPY", day(0), day(n))))
        });
    }
    group.finish();
}

// ── 2. Merged read ───────────────────────────────────────────────────

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");
    group.sample_size(20);
    for segments in [5i64, 30] {
        let tmp = tempfile::tempdir().unwrap();
        let cache = populated(tmp.path(), segments);
        group.bench_with_input(BenchmarkId::from_parameter(segments), &segments, |b, &n| {
            b.iter(|| black_box(cache.get("SPY", day(0), day(n))))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_is_covered, bench_get);
criterion_main!(benches);
