//! EODHD intraday data provider.
//!
//! One blocking HTTP GET per `fetch` call against
//! `{base}/intraday/{SYMBOL}.{EXCHANGE}`. The provider only classifies the
//! outcome; the fetcher above it owns rate limiting, backoff and retries.

use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::provider::{range_bounds, Bar, DataError, DataProvider};

/// Connection settings for the EODHD API (`[api]` config section).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EodhdConfig {
    pub base_url: String,
    pub api_key: String,
    pub exchange: String,
    pub interval: String,
    pub timeout_secs: u64,
}

impl Default for EodhdConfig {
    fn default() -> Self {
        Self {
            base_url: "https://eodhd.com/api".into(),
            api_key: String::new(),
            exchange: "US".into(),
            interval: "1m".into(),
            timeout_secs: 30,
        }
    }
}

/// One intraday record. Every field is optional in practice.
#[derive(Debug, Deserialize)]
struct IntradayRecord {
    timestamp: Option<i64>,
    datetime: Option<String>,
    open: Option<f64>,
    high: Option<f64>,
    low: Option<f64>,
    close: Option<f64>,
    volume: Option<f64>,
}

pub struct EodhdProvider {
    client: reqwest::blocking::Client,
    config: EodhdConfig,
}

impl EodhdProvider {
    pub fn new(config: EodhdConfig) -> Result<Self, DataError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| DataError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, symbol: &str) -> String {
        format!(
            "{}/intraday/{}.{}",
            self.config.base_url.trim_end_matches('/'),
            symbol.to_uppercase(),
            self.config.exchange
        )
    }
}

/// Parse a JSON array of intraday records, keeping rows inside `[from, to)`.
/// Rows without a usable timestamp are dropped.
pub(crate) fn parse_records(body: &str, from: NaiveDate, to: NaiveDate) -> Result<Vec<Bar>, DataError> {
    let records: Vec<IntradayRecord> = serde_json::from_str(body)
        .map_err(|e| DataError::Malformed(format!("expected JSON array of records: {e}")))?;

    let (start, end) = range_bounds(from, to);
    let bars = records
        .into_iter()
        .filter_map(|r| {
            let timestamp = r.timestamp.or_else(|| {
                r.datetime
                    .as_deref()
                    .and_then(|s| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").ok())
                    .map(|dt| dt.and_utc().timestamp())
            })?;
            Some(Bar {
                timestamp,
                open: r.open.unwrap_or(f64::NAN),
                high: r.high.unwrap_or(f64::NAN),
                low: r.low.unwrap_or(f64::NAN),
                close: r.close.unwrap_or(f64::NAN),
                volume: r.volume.map_or(0, |v| v.max(0.0) as u64),
            })
        })
        .filter(|b| b.timestamp >= start && b.timestamp < end)
        .collect();
    Ok(bars)
}

/// Map a non-2xx status onto the error taxonomy. Client errors other than
/// 404 and 429 will not change on retry, so they are `Validation`.
fn check_status(status: StatusCode, symbol: &str) -> Result<(), DataError> {
    match status {
        s if s.is_success() => Ok(()),
        StatusCode::TOO_MANY_REQUESTS => Err(DataError::QuotaExceeded),
        StatusCode::NOT_FOUND => Err(DataError::SymbolNotFound {
            symbol: symbol.to_string(),
        }),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(DataError::Validation(format!(
            "API key rejected (HTTP {})",
            status.as_u16()
        ))),
        s if s.is_client_error() => Err(DataError::Validation(format!(
            "{symbol}: request rejected (HTTP {})",
            s.as_u16()
        ))),
        s => Err(DataError::Server { status: s.as_u16() }),
    }
}

impl DataProvider for EodhdProvider {
    fn name(&self) -> &str {
        "eodhd"
    }

    fn fetch(&self, symbol: &str, from: NaiveDate, to: NaiveDate) -> Result<Vec<Bar>, DataError> {
        let (start, end) = range_bounds(from, to);
        let (start, end) = (start.to_string(), end.to_string());
        let response = self
            .client
            .get(self.endpoint(symbol))
            .query(&[
                ("api_token", self.config.api_key.as_str()),
                ("interval", self.config.interval.as_str()),
                ("from", start.as_str()),
                ("to", end.as_str()),
                ("fmt", "json"),
            ])
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    DataError::Timeout(e.to_string())
                } else {
                    DataError::Network(e.to_string())
                }
            })?;

        check_status(response.status(), symbol)?;

        let body = response.text().map_err(|e| {
            if e.is_timeout() {
                DataError::Timeout(e.to_string())
            } else {
                DataError::Malformed(format!("failed to read body for {symbol}: {e}"))
            }
        })?;
        let bars = parse_records(&body, from, to)?;
        debug!(symbol, %from, %to, rows = bars.len(), "EODHD response");
        Ok(bars)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn endpoint_uses_symbol_and_exchange() {
        let provider = EodhdProvider::new(EodhdConfig {
            base_url: "https://example.test/api/".into(),
            ..EodhdConfig::default()
        })
        .unwrap();
        assert_eq!(provider.endpoint("aapl"), "https://example.test/api/intraday/AAPL.US");
    }

    #[test]
    fn parses_timestamp_and_datetime_records() {
        let body = r#"[
            {"timestamp": 1704186000, "gmtoffset": 0, "open": 1.0, "high": 2.0, "low": 0.5, "close": 1.5, "volume": 1200},
            {"datetime": "2024-01-02 09:31:00", "open": 1.5, "high": null, "low": 1.0, "close": 1.6, "volume": 300.0},
            {"open": 9.0, "close": 9.0}
        ]"#;
        let bars = parse_records(body, day(2024, 1, 2), day(2024, 1, 3)).unwrap();

        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].timestamp, 1_704_186_000);
        assert_eq!(bars[0].volume, 1200);
        assert_eq!(bars[1].timestamp, 1_704_187_860);
        assert!(bars[1].high.is_nan());
        assert_eq!(bars[1].volume, 300);
    }

    #[test]
    fn rows_outside_range_are_dropped() {
        let body = r#"[{"timestamp": 1704067200, "close": 1.0}, {"timestamp": 1704153600, "close": 2.0}]"#;
        let bars = parse_records(body, day(2024, 1, 1), day(2024, 1, 2)).unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].close, 1.0);
    }

    #[test]
    fn non_array_body_is_malformed() {
        let err = parse_records(r#"{"error": "bad token"}"#, day(2024, 1, 1), day(2024, 1, 2))
            .unwrap_err();
        assert!(matches!(err, DataError::Malformed(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn client_errors_are_not_retried() {
        assert!(check_status(StatusCode::OK, "SPY").is_ok());
        assert!(matches!(
            check_status(StatusCode::TOO_MANY_REQUESTS, "SPY"),
            Err(DataError::QuotaExceeded)
        ));
        assert!(matches!(
            check_status(StatusCode::NOT_FOUND, "SPY"),
            Err(DataError::SymbolNotFound { .. })
        ));
        for code in [401, 403, 422] {
            let status = StatusCode::from_u16(code).unwrap();
            let err = check_status(status, "SPY").unwrap_err();
            assert!(matches!(err, DataError::Validation(_)), "{code}: {err}");
            assert!(!err.is_transient());
        }
        let err = check_status(StatusCode::BAD_GATEWAY, "SPY").unwrap_err();
        assert!(matches!(err, DataError::Server { status: 502 }));
        assert!(err.is_transient());
    }

    #[test]
    fn empty_array_is_empty_result() {
        let bars = parse_records("[]", day(2024, 1, 1), day(2024, 1, 2)).unwrap();
        assert!(bars.is_empty());
    }
}
