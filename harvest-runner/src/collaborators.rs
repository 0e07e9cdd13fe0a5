//! External collaborators invoked once per job: feature computation and
//! profile storage.
//!
//! The controller treats both as opaque synchronous calls. Their errors turn
//! the job into `failed` and are never retried here.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use harvest_core::Bar;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Named scalar features computed for one symbol.
pub type FeatureSet = BTreeMap<String, f64>;

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("feature computation failed: {0}")]
    Features(String),

    #[error("profile storage failed: {0}")]
    Storage(String),

    #[error("profile I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("profile JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// What the storage collaborator keeps per symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub symbol: String,
    pub data_start: NaiveDate,
    pub data_end: NaiveDate,
    /// Unix seconds of the newest stored bar; incremental runs fetch past it.
    pub last_timestamp: i64,
    pub data_points: usize,
    pub features: FeatureSet,
    pub updated_at: DateTime<Utc>,
}

pub trait FeatureProcessor: Send + Sync {
    fn process(&self, symbol: &str, bars: &[Bar]) -> Result<FeatureSet, CollaboratorError>;

    /// Fold features of newly fetched bars into the stored set of an earlier
    /// run. The default keeps every stored key and takes the newest value.
    fn merge(&self, previous: &FeatureSet, latest: FeatureSet) -> FeatureSet {
        let mut merged = previous.clone();
        merged.extend(latest);
        merged
    }
}

/// Key-value profile store keyed by symbol.
pub trait ProfileStore: Send + Sync {
    fn get(&self, symbol: &str) -> Result<Option<Profile>, CollaboratorError>;
    fn save(&self, profile: &Profile) -> Result<(), CollaboratorError>;
}

// ── Summary features ────────────────────────────────────────────────

/// Row count, first/last close, total return, and mean/stdev of
/// close-to-close returns. Bars with a non-finite close are ignored.
///
/// Merging is exact: the stored set carries the return count, and the
/// return across the boundary of the two slices is added back in.
#[derive(Debug, Clone, Copy, Default)]
pub struct SummaryFeatures;

/// Running moments of close-to-close returns (count, mean, sum of squared
/// deviations).
#[derive(Debug, Clone, Copy, PartialEq)]
struct Moments {
    count: f64,
    mean: f64,
    m2: f64,
}

impl Moments {
    fn of(returns: &[f64]) -> Self {
        returns.iter().fold(
            Moments {
                count: 0.0,
                mean: 0.0,
                m2: 0.0,
            },
            |acc, &r| {
                acc.combine(Moments {
                    count: 1.0,
                    mean: r,
                    m2: 0.0,
                })
            },
        )
    }

    fn combine(self, other: Moments) -> Moments {
        let count = self.count + other.count;
        if count == 0.0 {
            return self;
        }
        let delta = other.mean - self.mean;
        Moments {
            count,
            mean: self.mean + delta * other.count / count,
            m2: self.m2 + other.m2 + delta * delta * self.count * other.count / count,
        }
    }

    fn stdev(&self) -> f64 {
        if self.count < 2.0 {
            0.0
        } else {
            (self.m2 / (self.count - 1.0)).sqrt()
        }
    }

    fn from_features(f: &FeatureSet) -> Option<Self> {
        let count = *f.get("return_count")?;
        let stdev = *f.get("stdev_return")?;
        Some(Moments {
            count,
            mean: *f.get("mean_return")?,
            m2: if count < 2.0 { 0.0 } else { stdev * stdev * (count - 1.0) },
        })
    }
}

fn summary(rows: f64, first: f64, last: f64, moments: Moments) -> FeatureSet {
    let total_return = if first == 0.0 { 0.0 } else { last / first - 1.0 };
    let mut features = FeatureSet::new();
    features.insert("rows".into(), rows);
    features.insert("first_close".into(), first);
    features.insert("last_close".into(), last);
    features.insert("total_return".into(), total_return);
    features.insert("return_count".into(), moments.count);
    features.insert("mean_return".into(), moments.mean);
    features.insert("stdev_return".into(), moments.stdev());
    features
}

impl FeatureProcessor for SummaryFeatures {
    fn process(&self, symbol: &str, bars: &[Bar]) -> Result<FeatureSet, CollaboratorError> {
        let closes: Vec<f64> = bars
            .iter()
            .map(|b| b.close)
            .filter(|c| c.is_finite())
            .collect();
        let (Some(&first), Some(&last)) = (closes.first(), closes.last()) else {
            return Err(CollaboratorError::Features(format!(
                "{symbol}: no bars with a valid close"
            )));
        };

        let returns: Vec<f64> = closes
            .windows(2)
            .filter(|w| w[0] != 0.0)
            .map(|w| w[1] / w[0] - 1.0)
            .collect();
        Ok(summary(bars.len() as f64, first, last, Moments::of(&returns)))
    }

    fn merge(&self, previous: &FeatureSet, latest: FeatureSet) -> FeatureSet {
        let get = |f: &FeatureSet, key: &str| f.get(key).copied();
        let (Some(old), Some(new)) = (Moments::from_features(previous), Moments::from_features(&latest))
        else {
            return latest;
        };
        let (Some(rows), Some(first), Some(prev_last)) = (
            get(previous, "rows"),
            get(previous, "first_close"),
            get(previous, "last_close"),
        ) else {
            return latest;
        };
        let (Some(new_rows), Some(new_first), Some(last)) = (
            get(&latest, "rows"),
            get(&latest, "first_close"),
            get(&latest, "last_close"),
        ) else {
            return latest;
        };

        let bridge: Vec<f64> = if prev_last != 0.0 {
            vec![new_first / prev_last - 1.0]
        } else {
            Vec::new()
        };
        let moments = old.combine(Moments::of(&bridge)).combine(new);
        summary(rows + new_rows, first, last, moments)
    }
}

// ── JSON profile store ──────────────────────────────────────────────

/// One `{SYMBOL}.json` file per profile. Writes are atomic (.tmp + rename).
pub struct JsonProfileStore {
    dir: PathBuf,
}

impl JsonProfileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CollaboratorError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, symbol: &str) -> PathBuf {
        self.dir.join(format!("{symbol}.json"))
    }
}

impl ProfileStore for JsonProfileStore {
    fn get(&self, symbol: &str) -> Result<Option<Profile>, CollaboratorError> {
        match fs::read_to_string(self.path(symbol)) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, profile: &Profile) -> Result<(), CollaboratorError> {
        let path = self.path(&profile.symbol);
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, serde_json::to_string_pretty(profile)?)?;
        fs::rename(&tmp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            CollaboratorError::Storage(format!("atomic rename failed: {e}"))
        })
    }
}

// ── In-memory profile store ─────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryProfileStore {
    profiles: Mutex<HashMap<String, Profile>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.profiles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.lock().is_empty()
    }
}

impl ProfileStore for MemoryProfileStore {
    fn get(&self, symbol: &str) -> Result<Option<Profile>, CollaboratorError> {
        Ok(self.profiles.lock().get(symbol).cloned())
    }

    fn save(&self, profile: &Profile) -> Result<(), CollaboratorError> {
        self.profiles
            .lock()
            .insert(profile.symbol.clone(), profile.clone());
        Ok(())
    }
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
            volume: 1,
        }
    }

    fn profile(symbol: &str) -> Profile {
        Profile {
            symbol: symbol.into(),
            data_start: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            data_end: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            last_timestamp: 1_706_745_600,
            data_points: 42,
            features: FeatureSet::from([("rows".to_string(), 42.0)]),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn summary_features() {
        let bars = [bar(0, 100.0), bar(60, 110.0), bar(120, 99.0), bar(180, f64::NAN)];
        let f = SummaryFeatures.process("SPY", &bars).unwrap();

        assert_eq!(f["rows"], 4.0);
        assert_eq!(f["first_close"], 100.0);
        assert_eq!(f["last_close"], 99.0);
        assert!((f["total_return"] - -0.01).abs() < 1e-12);
        assert!((f["mean_return"] - 0.0).abs() < 1e-12);
        assert!(f["stdev_return"] > 0.0);
    }

    #[test]
    fn merged_summary_matches_full_recompute() {
        let closes = [100.0, 110.0, 99.0, 101.5, 120.0, 118.0, 125.0];
        let bars: Vec<Bar> = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| bar(i as i64 * 60, c))
            .collect();
        let whole = SummaryFeatures.process("SPY", &bars).unwrap();

        for split in 1..bars.len() {
            let head = SummaryFeatures.process("SPY", &bars[..split]).unwrap();
            let tail = SummaryFeatures.process("SPY", &bars[split..]).unwrap();
            let merged = SummaryFeatures.merge(&head, tail);
            assert_eq!(merged.len(), whole.len());
            for (key, value) in &whole {
                assert!(
                    (merged[key] - value).abs() < 1e-9,
                    "split {split}, {key}: {} vs {value}",
                    merged[key]
                );
            }
        }
    }

    #[test]
    fn merge_without_stored_moments_takes_latest() {
        let stored = FeatureSet::from([("rows".to_string(), 42.0)]);
        let latest = SummaryFeatures.process("SPY", &[bar(0, 1.0), bar(60, 2.0)]).unwrap();
        assert_eq!(SummaryFeatures.merge(&stored, latest.clone()), latest);
    }

    #[test]
    fn summary_features_reject_empty() {
        let err = SummaryFeatures.process("SPY", &[]).unwrap_err();
        assert!(matches!(err, CollaboratorError::Features(_)));
    }

    #[test]
    fn json_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonProfileStore::new(dir.path().join("profiles")).unwrap();

        assert!(store.get("AAPL").unwrap().is_none());
        let p = profile("AAPL");
        store.save(&p).unwrap();
        assert_eq!(store.get("AAPL").unwrap(), Some(p));
    }

    #[test]
    fn json_store_reports_corrupt_profile() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonProfileStore::new(dir.path()).unwrap();
        fs::write(dir.path().join("BAD.json"), "not json").unwrap();
        assert!(matches!(store.get("BAD"), Err(CollaboratorError::Json(_))));
    }

    #[test]
    fn memory_store() {
        let store = MemoryProfileStore::new();
        assert!(store.is_empty());
        store.save(&profile("MSFT")).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("MSFT").unwrap().unwrap().data_points, 42);
    }
}
