//! Pipeline configuration, loaded from TOML.
//!
//! Every section has `#[serde(default)]`, so a partial file (or none at all)
//! yields a working configuration. The API key may come from the
//! `EODHD_API_KEY` environment variable when the file leaves it empty.

use std::path::{Path, PathBuf};
use std::time::Duration;

use harvest_core::{CacheConfig, EodhdConfig, RateLimitConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable consulted for the API key.
pub const API_KEY_ENV: &str = "EODHD_API_KEY";

const MB: u64 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Incremental runs only fetch what is newer than the stored profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    #[default]
    Incremental,
    Full,
}

impl std::str::FromStr for FetchMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "incremental" => Ok(Self::Incremental),
            "full" => Ok(Self::Full),
            other => Err(ConfigError::Invalid(format!(
                "unknown fetch mode '{other}' (expected incremental or full)"
            ))),
        }
    }
}

/// `[pipeline]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub workers: usize,
    pub mode: FetchMode,
    pub chunk_days: u32,
    pub max_history_days: u32,
    /// Full-history discovery stops after this many empty chunks in a row.
    pub max_consecutive_empty: u32,
    pub metrics_interval_secs: u64,
    pub retry_attempts: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism().map_or(4, |n| n.get()),
            mode: FetchMode::Incremental,
            chunk_days: 30,
            max_history_days: 25 * 365,
            max_consecutive_empty: 5,
            metrics_interval_secs: 10,
            retry_attempts: 3,
        }
    }
}

impl PipelineSettings {
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs.max(1))
    }
}

/// `[cache]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Defaults to `~/.harvest_cache` when unset.
    pub dir: Option<PathBuf>,
    pub ttl_days: u64,
    pub max_total_mb: u64,
    pub max_segment_mb: u64,
    pub eviction_floor: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            dir: None,
            ttl_days: 30,
            max_total_mb: 2048,
            max_segment_mb: 256,
            eviction_floor: 5,
        }
    }
}

impl CacheSettings {
    /// Cache configuration rooted at `dir`, or at `fallback_dir` when the
    /// file does not name one.
    pub fn to_cache_config(&self, fallback_dir: &Path) -> CacheConfig {
        let mut config = CacheConfig::new(self.dir.clone().unwrap_or_else(|| fallback_dir.to_path_buf()));
        config.ttl = Duration::from_secs(self.ttl_days * 24 * 3600);
        config.max_total_bytes = self.max_total_mb * MB;
        config.max_segment_bytes = self.max_segment_mb * MB;
        config.eviction_floor = self.eviction_floor;
        config
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub pipeline: PipelineSettings,
    pub rate_limit: RateLimitConfig,
    pub cache: CacheSettings,
    pub api: EodhdConfig,
}

impl PipelineConfig {
    /// Load a configuration from a TOML file, then apply the environment.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml(&content)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Fill an empty API key from `EODHD_API_KEY`.
    pub fn apply_env(&mut self) {
        if self.api.api_key.is_empty() {
            if let Ok(key) = std::env::var(API_KEY_ENV) {
                self.api.api_key = key;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.pipeline;
        if p.workers == 0 {
            return Err(ConfigError::Invalid("pipeline.workers must be at least 1".into()));
        }
        if p.chunk_days == 0 {
            return Err(ConfigError::Invalid("pipeline.chunk_days must be at least 1".into()));
        }
        if p.max_history_days == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.max_history_days must be at least 1".into(),
            ));
        }
        let r = &self.rate_limit;
        if r.calls_per_minute == 0 || r.calls_per_day == 0 {
            return Err(ConfigError::Invalid("rate limits must be non-zero".into()));
        }
        if !(r.safety_margin > 0.0 && r.safety_margin <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "rate_limit.safety_margin must be in (0, 1], got {}",
                r.safety_margin
            )));
        }
        if r.max_retry_delay_secs < r.initial_retry_delay_secs {
            return Err(ConfigError::Invalid(
                "rate_limit.max_retry_delay_secs is below initial_retry_delay_secs".into(),
            ));
        }
        Ok(())
    }

    /// The rate budget each worker gets.
    pub fn worker_rate_limit(&self) -> RateLimitConfig {
        self.rate_limit.per_worker(self.pipeline.workers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = PipelineConfig::from_toml("").unwrap();
        assert_eq!(config.pipeline.chunk_days, 30);
        assert_eq!(config.pipeline.max_consecutive_empty, 5);
        assert_eq!(config.rate_limit.calls_per_minute, 80);
        assert_eq!(config.cache.ttl_days, 30);
        assert_eq!(config.api.exchange, "US");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let toml_str = r#"
            [pipeline]
            workers = 4
            mode = "full"

            [rate_limit]
            calls_per_minute = 40

            [cache]
            dir = "/tmp/harvest"
            max_total_mb = 100
        "#;
        let config = PipelineConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.pipeline.workers, 4);
        assert_eq!(config.pipeline.mode, FetchMode::Full);
        assert_eq!(config.pipeline.chunk_days, 30);
        assert_eq!(config.rate_limit.calls_per_minute, 40);
        assert_eq!(config.rate_limit.calls_per_day, 95_000);

        let share = config.worker_rate_limit();
        assert_eq!(share.calls_per_minute, 9);

        let cache = config.cache.to_cache_config(Path::new("/unused"));
        assert_eq!(cache.dir, PathBuf::from("/tmp/harvest"));
        assert_eq!(cache.max_total_bytes, 100 * MB);
        assert_eq!(cache.ttl, Duration::from_secs(30 * 86_400));
    }

    #[test]
    fn rejects_zero_workers() {
        let config = PipelineConfig::from_toml("[pipeline]\nworkers = 0\n").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_unknown_mode() {
        assert!(PipelineConfig::from_toml("[pipeline]\nmode = \"sideways\"\n").is_err());
        assert!("sideways".parse::<FetchMode>().is_err());
        assert_eq!("FULL".parse::<FetchMode>().unwrap(), FetchMode::Full);
    }

    #[test]
    fn file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harvest.toml");
        std::fs::write(&path, "[api]\napi_key = \"abc\"\ninterval = \"5m\"\n").unwrap();

        let config = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(config.api.api_key, "abc");
        assert_eq!(config.api.interval, "5m");

        let missing = PipelineConfig::from_file(&dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }
}
