//! Property tests for cache and coverage invariants.
//!
//! 1. `get` after `put` is sorted, duplicate-free and a subset of what was written
//! 2. Coverage watermark: contiguous segments cover, a gap never does

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{NaiveDate, TimeZone, Utc};
use harvest_core::data::range_bounds;
use harvest_core::{Bar, CacheConfig, ManualClock, RangeCache};
use proptest::prelude::*;

// ── Helpers ──────────────────────────────────────────────────────────

fn base() -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 1, 1).unwrap()
}

fn day(offset: u32) -> NaiveDate {
    base() + chrono::Duration::days(offset as i64)
}

fn open_cache(dir: &std::path::Path) -> RangeCache {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap(),
    ));
    RangeCache::open(CacheConfig::new(dir), clock).unwrap()
}

fn bars_at(offsets: &[i64], from: NaiveDate) -> Vec<Bar> {
    let (start, _) = range_bounds(from, from);
    offsets
        .iter()
        .map(|o| Bar {
            timestamp: start + o,
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: *o as f64,
            volume: 1,
        })
        .collect()
}

// ── Strategies (proptest) ────────────────────────────────────────────

/// (start offset, length) of a segment in days, plus row offsets in seconds
/// relative to the segment start (unsorted, possibly duplicated).
fn arb_segment() -> impl Strategy<Value = (u32, u32, Vec<i64>)> {
    (0u32..20, 1u32..6).prop_flat_map(|(start, len)| {
        let span = len as i64 * 86_400;
        (
            Just(start),
            Just(len),
            prop::collection::vec(0..span, 0..30),
        )
    })
}

// ── 1. Merge properties ──────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn get_is_sorted_unique_subset(
        segments in prop::collection::vec(arb_segment(), 1..4),
        q_start in 0u32..20,
        q_len in 1u32..10,
    ) {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open_cache(tmp.path());

        let mut written = HashSet::new();
        for (start, len, offsets) in &segments {
            let bars = bars_at(offsets, day(*start));
            written.extend(bars.iter().map(|b| b.timestamp));
            cache.put("SPY", day(*start), day(start + len), &bars).unwrap();
        }

        let (from, to) = (day(q_start), day(q_start + q_len));
        if let Some(got) = cache.get("SPY", from, to) {
            let (lo, hi) = range_bounds(from, to);
            prop_assert!(got.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
            for bar in &got {
                prop_assert!(written.contains(&bar.timestamp));
                prop_assert!(bar.timestamp >= lo && bar.timestamp < hi);
            }
        }
    }
}

// ── 2. Coverage watermark ────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn contiguous_segments_cover(a in 0u32..10, ab in 1u32..10, bc in 1u32..10) {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open_cache(tmp.path());
        let (b, c) = (a + ab, a + ab + bc);
        cache.put("QQQ", day(a), day(b), &bars_at(&[0], day(a))).unwrap();
        cache.put("QQQ", day(b), day(c), &bars_at(&[0], day(b))).unwrap();

        prop_assert!(cache.is_covered("QQQ", day(a), day(c)));
    }

    #[test]
    fn gap_is_never_covered(a in 0u32..10, ab in 1u32..10, gap in 1u32..5, tail in 1u32..10) {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open_cache(tmp.path());
        let b = a + ab;
        let (resume, c) = (b + gap, b + gap + tail);
        cache.put("QQQ", day(a), day(b), &bars_at(&[0], day(a))).unwrap();
        cache.put("QQQ", day(resume), day(c), &bars_at(&[0], day(resume))).unwrap();

        prop_assert!(!cache.is_covered("QQQ", day(a), day(c)));
    }
}
