//! Range-aware segment cache.
//!
//! Layout: `{cache_dir}/manifest.json` + `{cache_dir}/{key}.parquet`
//!
//! - One payload per fetched (symbol, date range) segment; `key` is the
//!   BLAKE3 hex of `symbol|from|to`, so different segments never share a path
//! - Atomic payload writes (write to .tmp, rename into place), done outside
//!   the manifest lock
//! - Merging is lazy: `get` reads every live segment intersecting the query
//! - TTL is checked on read; expired entries are purged on open and on `put`
//! - Size eviction after every write: over the cap, drop oldest entries
//!   until only `eviction_floor` remain
//! - A missing or corrupt manifest is rebuilt from the payload files; such
//!   entries are flagged `degraded` and never answer queries
//! - An unreadable payload is removed together with its entry and reads as
//!   a miss

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::provider::{merge_bars, Bar, DataError};
use crate::clock::Clock;

const MANIFEST_FILE: &str = "manifest.json";
const MANIFEST_VERSION: u32 = 1;
const MB: u64 = 1024 * 1024;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Cache location and policy.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub ttl: Duration,
    pub max_total_bytes: u64,
    pub max_segment_bytes: u64,
    /// Entries that survive a size eviction.
    pub eviction_floor: usize,
}

impl CacheConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ttl: Duration::from_secs(30 * 24 * 3600),
            max_total_bytes: 2048 * MB,
            max_segment_bytes: 256 * MB,
            eviction_floor: 5,
        }
    }
}

/// Manifest metadata for one stored segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub symbol: Option<String>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub rows: usize,
    pub size_bytes: u64,
    /// Reconstructed from a payload file alone; symbol and range unknown.
    #[serde(default)]
    pub degraded: bool,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        (now - self.created_at)
            .to_std()
            .map(|age| age > ttl)
            .unwrap_or(false)
    }

    /// Date range of a usable entry for `symbol`.
    fn range_for(&self, symbol: &str) -> Option<(NaiveDate, NaiveDate)> {
        if self.degraded || self.symbol.as_deref() != Some(symbol) {
            return None;
        }
        Some((self.start?, self.end?))
    }
}

/// Result of `RangeCache::put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    SkippedEmpty,
    SkippedTooLarge,
}

/// Summary for `harvest cache status`.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub degraded: usize,
    pub total_bytes: u64,
    pub max_total_bytes: u64,
    pub usage_percent: f64,
    pub dir: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    entries: BTreeMap<String, CacheEntry>,
}

/// The segment cache. Shared by all workers behind an `Arc`.
pub struct RangeCache {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    entries: Mutex<BTreeMap<String, CacheEntry>>,
}

impl RangeCache {
    /// Open (or create) the cache at `config.dir`.
    pub fn open(config: CacheConfig, clock: Arc<dyn Clock>) -> Result<Self, DataError> {
        fs::create_dir_all(&config.dir)
            .map_err(|e| DataError::Cache(format!("failed to create dir: {e}")))?;

        let entries = match load_manifest(&config.dir) {
            Ok(Some(entries)) => entries,
            Ok(None) => {
                let rebuilt = rebuild_from_payloads(&config.dir)?;
                if !rebuilt.is_empty() {
                    warn!(
                        dir = %config.dir.display(),
                        entries = rebuilt.len(),
                        "cache manifest missing, rebuilt from payload files"
                    );
                    save_manifest(&config.dir, &rebuilt)?;
                }
                rebuilt
            }
            Err(e) => {
                warn!(error = %e, "cache manifest unreadable, rebuilding from payload files");
                let rebuilt = rebuild_from_payloads(&config.dir)?;
                save_manifest(&config.dir, &rebuilt)?;
                rebuilt
            }
        };

        let cache = Self {
            config,
            clock,
            entries: Mutex::new(entries),
        };
        cache.purge_expired()?;
        Ok(cache)
    }

    /// Whether a segment ending (exclusively) at `to` can no longer gain rows.
    /// Segments reaching past today are still filling in and are not cached.
    pub fn is_settled(&self, to: NaiveDate) -> bool {
        to <= self.clock.now().date_naive()
    }

    /// Merge every live segment of `symbol` intersecting `[from, to)`.
    ///
    /// `None` when no segment intersects. The result is restricted to the
    /// query range, sorted by timestamp and free of duplicates.
    pub fn get(&self, symbol: &str, from: NaiveDate, to: NaiveDate) -> Option<Vec<Bar>> {
        let keys = self.intersecting(symbol, from, to);
        if keys.is_empty() {
            return None;
        }

        let mut bars = Vec::new();
        let mut hits = 0usize;
        for (key, _, _) in &keys {
            match read_payload(&self.payload_path(key)) {
                Ok(segment) => {
                    hits += 1;
                    bars.extend(segment);
                }
                Err(e) => {
                    warn!(symbol, key = %key, error = %e, "dropping unreadable cache segment");
                    self.remove_keys(std::slice::from_ref(key));
                }
            }
        }
        if hits == 0 {
            return None;
        }
        debug!(symbol, segments = hits, rows = bars.len(), "cache hit");
        Some(merge_bars(bars, from, to))
    }

    /// Store one fetched segment.
    pub fn put(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
        bars: &[Bar],
    ) -> Result<PutOutcome, DataError> {
        if bars.is_empty() {
            return Ok(PutOutcome::SkippedEmpty);
        }
        let estimate = (std::mem::size_of::<Bar>() * bars.len()) as u64;
        if estimate > self.config.max_segment_bytes {
            info!(
                symbol,
                estimate_mb = estimate / MB,
                limit_mb = self.config.max_segment_bytes / MB,
                "segment too large to cache, skipping"
            );
            return Ok(PutOutcome::SkippedTooLarge);
        }

        let key = segment_key(symbol, from, to);
        let path = self.payload_path(&key);
        let tmp_path = self.config.dir.join(format!(
            "{key}.{}.{}.tmp",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let written = bars_to_dataframe(bars)
            .and_then(|mut df| write_parquet(&mut df, &tmp_path))
            .and_then(|()| {
                fs::rename(&tmp_path, &path)
                    .map_err(|e| DataError::Cache(format!("atomic rename failed: {e}")))
            });
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
        let size_bytes = fs::metadata(&path)
            .map(|m| m.len())
            .map_err(|e| DataError::Cache(format!("stat payload: {e}")))?;

        let now = self.clock.now();
        let mut entries = self.entries.lock();
        entries.insert(
            key,
            CacheEntry {
                symbol: Some(symbol.to_string()),
                start: Some(from),
                end: Some(to),
                created_at: now,
                rows: bars.len(),
                size_bytes,
                degraded: false,
            },
        );
        self.expire_locked(&mut entries, now);
        self.evict_locked(&mut entries);
        save_manifest(&self.config.dir, &entries)?;
        debug!(symbol, %from, %to, rows = bars.len(), "cached segment");
        Ok(PutOutcome::Stored)
    }

    /// Whether live segments cover `[from, to)` without a gap.
    pub fn is_covered(&self, symbol: &str, from: NaiveDate, to: NaiveDate) -> bool {
        if from >= to {
            return true;
        }
        let mut segments = self.intersecting(symbol, from, to);
        segments.sort_by_key(|(_, start, _)| *start);

        let mut watermark = from;
        for (_, start, end) in segments {
            if start > watermark {
                return false;
            }
            watermark = watermark.max(end);
            if watermark >= to {
                return true;
            }
        }
        watermark >= to
    }

    /// Remove every entry of `symbol`, or all entries (degraded included).
    /// Returns the number of entries removed.
    pub fn clear(&self, symbol: Option<&str>) -> Result<usize, DataError> {
        let mut entries = self.entries.lock();
        let keys: Vec<String> = entries
            .iter()
            .filter(|(_, e)| symbol.is_none() || e.symbol.as_deref() == symbol)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            entries.remove(key);
            remove_payload(&self.payload_path(key));
        }
        save_manifest(&self.config.dir, &entries)?;
        info!(symbol = symbol.unwrap_or("*"), removed = keys.len(), "cache cleared");
        Ok(keys.len())
    }

    /// Drop expired entries and their payloads. Returns how many were dropped.
    pub fn purge_expired(&self) -> Result<usize, DataError> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let removed = self.expire_locked(&mut entries, now);
        if removed > 0 {
            save_manifest(&self.config.dir, &entries)?;
        }
        Ok(removed)
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock();
        let total_bytes: u64 = entries.values().map(|e| e.size_bytes).sum();
        let usage_percent = if self.config.max_total_bytes == 0 {
            0.0
        } else {
            total_bytes as f64 / self.config.max_total_bytes as f64 * 100.0
        };
        CacheStats {
            entries: entries.len(),
            degraded: entries.values().filter(|e| e.degraded).count(),
            total_bytes,
            max_total_bytes: self.config.max_total_bytes,
            usage_percent,
            dir: self.config.dir.clone(),
        }
    }

    /// Live segment ranges held for `symbol`, sorted by start date.
    pub fn cached_ranges(&self, symbol: &str) -> Vec<(NaiveDate, NaiveDate)> {
        let now = self.clock.now();
        let entries = self.entries.lock();
        let mut ranges: Vec<_> = entries
            .values()
            .filter(|e| !e.is_expired(now, self.config.ttl))
            .filter_map(|e| e.range_for(symbol))
            .collect();
        ranges.sort();
        ranges
    }

    /// Snapshot of the manifest, for diagnostics and tests.
    pub fn entries(&self) -> Vec<(String, CacheEntry)> {
        self.entries
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn payload_path(&self, key: &str) -> PathBuf {
        self.config.dir.join(format!("{key}.parquet"))
    }

    fn intersecting(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Vec<(String, NaiveDate, NaiveDate)> {
        let now = self.clock.now();
        let entries = self.entries.lock();
        entries
            .iter()
            .filter(|(_, e)| !e.is_expired(now, self.config.ttl))
            .filter_map(|(k, e)| {
                let (start, end) = e.range_for(symbol)?;
                (start < to && end > from).then(|| (k.clone(), start, end))
            })
            .collect()
    }

    fn remove_keys(&self, keys: &[String]) {
        let mut entries = self.entries.lock();
        for key in keys {
            entries.remove(key);
            remove_payload(&self.payload_path(key));
        }
        if let Err(e) = save_manifest(&self.config.dir, &entries) {
            warn!(error = %e, "failed to persist cache manifest");
        }
    }

    fn expire_locked(&self, entries: &mut BTreeMap<String, CacheEntry>, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.is_expired(now, self.config.ttl))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            entries.remove(key);
            remove_payload(&self.payload_path(key));
        }
        if !expired.is_empty() {
            info!(removed = expired.len(), "purged expired cache segments");
        }
        expired.len()
    }

    fn evict_locked(&self, entries: &mut BTreeMap<String, CacheEntry>) {
        let total: u64 = entries.values().map(|e| e.size_bytes).sum();
        if total <= self.config.max_total_bytes || entries.len() <= self.config.eviction_floor {
            return;
        }

        let mut by_age: Vec<(DateTime<Utc>, String)> = entries
            .iter()
            .map(|(k, e)| (e.created_at, k.clone()))
            .collect();
        by_age.sort();
        let excess = entries.len() - self.config.eviction_floor;
        for (_, key) in by_age.into_iter().take(excess) {
            entries.remove(&key);
            remove_payload(&self.payload_path(&key));
        }
        info!(
            removed = excess,
            total_mb = total / MB,
            limit_mb = self.config.max_total_bytes / MB,
            "cache over size cap, evicted oldest segments"
        );
    }
}

/// Content-derived key of one segment.
pub fn segment_key(symbol: &str, from: NaiveDate, to: NaiveDate) -> String {
    blake3::hash(format!("{symbol}|{from}|{to}").as_bytes())
        .to_hex()
        .to_string()
}

fn remove_payload(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove cache payload");
        }
    }
}

// ── Manifest I/O ────────────────────────────────────────────────────

/// `Ok(None)` when there is no manifest file.
fn load_manifest(dir: &Path) -> Result<Option<BTreeMap<String, CacheEntry>>, DataError> {
    let path = dir.join(MANIFEST_FILE);
    let content = match fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(DataError::Cache(format!("read manifest: {e}"))),
    };
    let manifest: Manifest = serde_json::from_str(&content)
        .map_err(|e| DataError::Cache(format!("parse manifest: {e}")))?;
    Ok(Some(manifest.entries))
}

fn save_manifest(dir: &Path, entries: &BTreeMap<String, CacheEntry>) -> Result<(), DataError> {
    let manifest = Manifest {
        version: MANIFEST_VERSION,
        entries: entries.clone(),
    };
    let json = serde_json::to_string_pretty(&manifest)
        .map_err(|e| DataError::Cache(format!("manifest serialization: {e}")))?;
    let path = dir.join(MANIFEST_FILE);
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, json).map_err(|e| DataError::Cache(format!("manifest write: {e}")))?;
    fs::rename(&tmp_path, &path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        DataError::Cache(format!("manifest rename: {e}"))
    })
}

/// Reconstruct entries from `*.parquet` files. Only creation time and size
/// are recoverable.
fn rebuild_from_payloads(dir: &Path) -> Result<BTreeMap<String, CacheEntry>, DataError> {
    let mut entries = BTreeMap::new();
    let listing = fs::read_dir(dir).map_err(|e| DataError::Cache(format!("read dir: {e}")))?;
    for item in listing {
        let item = item.map_err(|e| DataError::Cache(format!("dir entry: {e}")))?;
        let path = item.path();
        if path.extension().and_then(|e| e.to_str()) != Some("parquet") {
            continue;
        }
        let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Ok(meta) = item.metadata() else {
            continue;
        };
        let created_at = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        entries.insert(
            key.to_string(),
            CacheEntry {
                symbol: None,
                start: None,
                end: None,
                created_at,
                rows: 0,
                size_bytes: meta.len(),
                degraded: true,
            },
        );
    }
    Ok(entries)
}

// ── Parquet I/O helpers ─────────────────────────────────────────────

fn bars_to_dataframe(bars: &[Bar]) -> Result<DataFrame, DataError> {
    let timestamps: Vec<i64> = bars.iter().map(|b| b.timestamp).collect();
    let opens: Vec<f64> = bars.iter().map(|b| b.open).collect();
    let highs: Vec<f64> = bars.iter().map(|b| b.high).collect();
    let lows: Vec<f64> = bars.iter().map(|b| b.low).collect();
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let volumes: Vec<u64> = bars.iter().map(|b| b.volume).collect();

    DataFrame::new(vec![
        Column::new("timestamp".into(), timestamps),
        Column::new("open".into(), opens),
        Column::new("high".into(), highs),
        Column::new("low".into(), lows),
        Column::new("close".into(), closes),
        Column::new("volume".into(), volumes),
    ])
    .map_err(|e| DataError::Parquet(format!("dataframe creation: {e}")))
}

fn write_parquet(df: &mut DataFrame, path: &Path) -> Result<(), DataError> {
    let file = fs::File::create(path).map_err(|e| DataError::Parquet(format!("create file: {e}")))?;
    ParquetWriter::new(file)
        .finish(df)
        .map_err(|e| DataError::Parquet(format!("write parquet: {e}")))?;
    Ok(())
}

fn read_payload(path: &Path) -> Result<Vec<Bar>, DataError> {
    let file = fs::File::open(path).map_err(|e| DataError::Parquet(format!("open: {e}")))?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| DataError::Parquet(format!("read: {e}")))?;

    let column = |name: &str| {
        df.column(name)
            .map_err(|_| DataError::Validation(format!("missing column '{name}'")))
    };
    let type_err = |name: &str, e: PolarsError| DataError::Parquet(format!("{name} column type: {e}"));

    let ts_ca = column("timestamp")?.i64().map_err(|e| type_err("timestamp", e))?;
    let open_ca = column("open")?.f64().map_err(|e| type_err("open", e))?;
    let high_ca = column("high")?.f64().map_err(|e| type_err("high", e))?;
    let low_ca = column("low")?.f64().map_err(|e| type_err("low", e))?;
    let close_ca = column("close")?.f64().map_err(|e| type_err("close", e))?;
    let vol_ca = column("volume")?.u64().map_err(|e| type_err("volume", e))?;

    let n = df.height();
    let mut bars = Vec::with_capacity(n);
    for i in 0..n {
        let timestamp = ts_ca
            .get(i)
            .ok_or_else(|| DataError::Parquet(format!("null timestamp at row {i}")))?;
        bars.push(Bar {
            timestamp,
            open: open_ca.get(i).unwrap_or(f64::NAN),
            high: high_ca.get(i).unwrap_or(f64::NAN),
            low: low_ca.get(i).unwrap_or(f64::NAN),
            close: close_ca.get(i).unwrap_or(f64::NAN),
            volume: vol_ca.get(i).unwrap_or(0),
        });
    }
    Ok(bars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::data::provider::range_bounds;
    use chrono::TimeZone;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        ))
    }

    /// One bar per hour over `[from, to)`.
    fn hourly(from: NaiveDate, to: NaiveDate) -> Vec<Bar> {
        let (start, end) = range_bounds(from, to);
        (start..end)
            .step_by(3600)
            .map(|ts| Bar {
                timestamp: ts,
                open: 1.0,
                high: 2.0,
                low: 0.5,
                close: 1.5,
                volume: 100,
            })
            .collect()
    }

    fn open(dir: &Path, clock: Arc<ManualClock>) -> RangeCache {
        RangeCache::open(CacheConfig::new(dir), clock).unwrap()
    }

    #[test]
    fn put_then_get_restricts_to_query() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(tmp.path(), clock());

        let bars = hourly(day(2024, 1, 1), day(2024, 1, 4));
        assert_eq!(
            cache.put("AAPL", day(2024, 1, 1), day(2024, 1, 4), &bars).unwrap(),
            PutOutcome::Stored
        );

        let got = cache.get("AAPL", day(2024, 1, 2), day(2024, 1, 3)).unwrap();
        assert_eq!(got.len(), 24);
        assert!(got.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert!(cache.get("MSFT", day(2024, 1, 1), day(2024, 1, 4)).is_none());
        assert!(cache.get("AAPL", day(2024, 2, 1), day(2024, 2, 2)).is_none());
    }

    #[test]
    fn overlapping_segments_merge_without_duplicates() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(tmp.path(), clock());

        cache
            .put("SPY", day(2024, 1, 1), day(2024, 1, 3), &hourly(day(2024, 1, 1), day(2024, 1, 3)))
            .unwrap();
        cache
            .put("SPY", day(2024, 1, 2), day(2024, 1, 5), &hourly(day(2024, 1, 2), day(2024, 1, 5)))
            .unwrap();

        let got = cache.get("SPY", day(2024, 1, 1), day(2024, 1, 5)).unwrap();
        assert_eq!(got.len(), 4 * 24);
        assert!(cache.is_covered("SPY", day(2024, 1, 1), day(2024, 1, 5)));
    }

    #[test]
    fn coverage_detects_gap() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(tmp.path(), clock());

        cache
            .put("QQQ", day(2024, 1, 1), day(2024, 1, 10), &hourly(day(2024, 1, 1), day(2024, 1, 2)))
            .unwrap();
        cache
            .put("QQQ", day(2024, 1, 12), day(2024, 1, 20), &hourly(day(2024, 1, 12), day(2024, 1, 13)))
            .unwrap();

        assert!(!cache.is_covered("QQQ", day(2024, 1, 1), day(2024, 1, 20)));
        assert!(cache.is_covered("QQQ", day(2024, 1, 2), day(2024, 1, 9)));
        assert!(cache.is_covered("QQQ", day(2024, 1, 12), day(2024, 1, 20)));
        assert!(!cache.is_covered("QQQ", day(2024, 1, 12), day(2024, 1, 21)));
    }

    #[test]
    fn expired_segments_are_invisible() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = clock();
        let mut config = CacheConfig::new(tmp.path());
        config.ttl = Duration::from_secs(1);
        let cache = RangeCache::open(config, clock.clone()).unwrap();

        cache
            .put("IWM", day(2024, 1, 1), day(2024, 1, 2), &hourly(day(2024, 1, 1), day(2024, 1, 2)))
            .unwrap();
        assert!(cache.is_covered("IWM", day(2024, 1, 1), day(2024, 1, 2)));

        clock.advance(Duration::from_secs(2));
        assert!(cache.get("IWM", day(2024, 1, 1), day(2024, 1, 2)).is_none());
        assert!(!cache.is_covered("IWM", day(2024, 1, 1), day(2024, 1, 2)));
        // Still on disk until purged.
        assert_eq!(cache.entries().len(), 1);
        assert_eq!(cache.purge_expired().unwrap(), 1);
        assert!(cache.entries().is_empty());
    }

    #[test]
    fn put_skips_empty_and_oversized() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = CacheConfig::new(tmp.path());
        config.max_segment_bytes = 10 * std::mem::size_of::<Bar>() as u64;
        let cache = RangeCache::open(config, clock()).unwrap();

        assert_eq!(
            cache.put("A", day(2024, 1, 1), day(2024, 1, 2), &[]).unwrap(),
            PutOutcome::SkippedEmpty
        );
        let big = hourly(day(2024, 1, 1), day(2024, 1, 2));
        assert_eq!(
            cache.put("A", day(2024, 1, 1), day(2024, 1, 2), &big).unwrap(),
            PutOutcome::SkippedTooLarge
        );
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn eviction_keeps_newest_floor() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = clock();
        let mut config = CacheConfig::new(tmp.path());
        config.max_total_bytes = 1;
        config.eviction_floor = 2;
        let cache = RangeCache::open(config, clock.clone()).unwrap();

        for d in 1..=4 {
            clock.advance(Duration::from_secs(60));
            let (from, to) = (day(2024, 1, d), day(2024, 1, d + 1));
            cache.put("DIA", from, to, &hourly(from, to)).unwrap();
        }

        assert_eq!(
            cache.cached_ranges("DIA"),
            vec![(day(2024, 1, 3), day(2024, 1, 4)), (day(2024, 1, 4), day(2024, 1, 5))]
        );
        let payloads = fs::read_dir(tmp.path())
            .unwrap()
            .filter(|e| {
                e.as_ref().unwrap().path().extension().and_then(|x| x.to_str()) == Some("parquet")
            })
            .count();
        assert_eq!(payloads, 2);
    }

    #[test]
    fn manifest_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = clock();
        {
            let cache = open(tmp.path(), clock.clone());
            cache
                .put("TLT", day(2024, 3, 1), day(2024, 3, 2), &hourly(day(2024, 3, 1), day(2024, 3, 2)))
                .unwrap();
        }
        let cache = open(tmp.path(), clock);
        assert!(cache.is_covered("TLT", day(2024, 3, 1), day(2024, 3, 2)));
        assert_eq!(cache.stats().degraded, 0);
    }

    #[test]
    fn corrupt_manifest_rebuilds_degraded_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = clock();
        {
            let cache = open(tmp.path(), clock.clone());
            cache
                .put("GLD", day(2024, 3, 1), day(2024, 3, 2), &hourly(day(2024, 3, 1), day(2024, 3, 2)))
                .unwrap();
        }
        fs::write(tmp.path().join(MANIFEST_FILE), "{ not json").unwrap();

        let cache = open(tmp.path(), clock);
        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.degraded, 1);
        assert!(stats.total_bytes > 0);
        // Degraded entries never answer queries.
        assert!(cache.get("GLD", day(2024, 3, 1), day(2024, 3, 2)).is_none());
        assert!(!cache.is_covered("GLD", day(2024, 3, 1), day(2024, 3, 2)));

        assert_eq!(cache.clear(None).unwrap(), 1);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn unreadable_payload_becomes_a_miss() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(tmp.path(), clock());
        let (from, to) = (day(2024, 5, 1), day(2024, 5, 2));
        cache.put("XLE", from, to, &hourly(from, to)).unwrap();

        let path = tmp.path().join(format!("{}.parquet", segment_key("XLE", from, to)));
        fs::write(&path, b"garbage").unwrap();

        assert!(cache.get("XLE", from, to).is_none());
        assert!(cache.entries().is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn failed_put_leaves_no_temp_file() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(tmp.path(), clock());
        let (from, to) = (day(2024, 1, 1), day(2024, 1, 2));
        // A non-empty directory where the payload should land blocks the rename.
        let blocker = tmp.path().join(format!("{}.parquet", segment_key("GLD", from, to)));
        fs::create_dir(&blocker).unwrap();
        fs::write(blocker.join("keep"), b"x").unwrap();

        assert!(cache.put("GLD", from, to, &hourly(from, to)).is_err());
        assert!(cache.entries().is_empty());
        let leftovers: Vec<_> = fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");
    }

    #[test]
    fn only_finished_days_are_settled() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = clock();
        let today = clock.now().date_naive();
        let cache = open(tmp.path(), clock);

        assert!(cache.is_settled(today));
        assert!(!cache.is_settled(today.succ_opt().unwrap()));
    }

    #[test]
    fn clear_by_symbol() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(tmp.path(), clock());
        let (from, to) = (day(2024, 1, 1), day(2024, 1, 2));
        cache.put("A", from, to, &hourly(from, to)).unwrap();
        cache.put("B", from, to, &hourly(from, to)).unwrap();

        assert_eq!(cache.clear(Some("A")).unwrap(), 1);
        assert!(cache.get("A", from, to).is_none());
        assert!(cache.get("B", from, to).is_some());
    }
}
