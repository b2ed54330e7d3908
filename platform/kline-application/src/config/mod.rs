use chrono::{DateTime, TimeZone, Utc};
use kline_domain::services::window_plan::last_closed_open;
use kline_domain::value_objects::exchange::Exchange;
use kline_domain::value_objects::fetch_window::RetryPolicy;
use kline_domain::value_objects::quality_report::QualityLimits;
use kline_domain::value_objects::resolution::Resolution;
use kline_domain::value_objects::series::SeriesKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub run: RunConfig,
    pub pairs: Vec<PairConfig>,
    pub resolutions: Option<ResolutionsConfig>,
    pub rate_limits: Option<BTreeMap<String, RateLimitConfig>>,
    pub retry: Option<RetryConfig>,
    pub http: Option<HttpConfig>,
    pub store: StoreConfig,
    pub data_quality: Option<DataQualityConfig>,
    pub paths: PathsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub run_id: String,
    /// RFC3339 or epoch seconds/milliseconds.
    pub start: String,
    /// Defaults to the last closed base bucket at load time.
    pub end: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PairConfig {
    pub exchange: Exchange,
    pub symbol: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ResolutionsConfig {
    pub base: Option<String>,
    pub derived: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub refill_per_sec: f64,
    pub workers: Option<usize>,
}

impl RateLimitConfig {
    /// Conservative budgets well under each venue's published weight limits.
    pub fn default_for(exchange: Exchange) -> Self {
        match exchange {
            Exchange::BinanceFutures => Self {
                capacity: 20,
                refill_per_sec: 10.0,
                workers: Some(4),
            },
            Exchange::DydxV4 => Self {
                capacity: 10,
                refill_per_sec: 5.0,
                workers: Some(2),
            },
        }
    }

    pub fn workers(&self) -> usize {
        self.workers.unwrap_or(1).max(1)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    pub timeout_ms: Option<u64>,
    pub binance_base_url: Option<String>,
    pub dydx_base_url: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub url: Option<String>,
    pub table: Option<String>,
    pub derived_table: Option<String>,
    pub pool_max_size: Option<u32>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct DataQualityConfig {
    pub max_gaps: Option<usize>,
    pub max_missing_buckets: Option<usize>,
    pub max_duplicates: Option<usize>,
    pub max_outliers: Option<usize>,
    pub max_partial: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    pub out_dir: String,
    pub dead_letter_path: Option<String>,
}

pub const DEFAULT_TABLE: &str = "kline_candles";
pub const DEFAULT_DERIVED_TABLE: &str = "kline_derived_candles";
/// One token per ~17 minutes.
pub const MIN_REFILL_PER_SEC: f64 = 0.001;
pub const DEFAULT_BINANCE_BASE_URL: &str = "https://fapi.binance.com";
pub const DEFAULT_DYDX_BASE_URL: &str = "https://indexer.dydx.trade";

impl Config {
    pub fn base_resolution(&self) -> Result<Resolution, String> {
        match self.resolutions.as_ref().and_then(|r| r.base.as_deref()) {
            Some(label) => Resolution::parse(label),
            None => Ok(Resolution::M1),
        }
    }

    pub fn derived_resolutions(&self) -> Result<Vec<Resolution>, String> {
        let base = self.base_resolution()?;
        let derived = match self.resolutions.as_ref().and_then(|r| r.derived.as_ref()) {
            Some(labels) => labels
                .iter()
                .map(|label| Resolution::parse(label))
                .collect::<Result<Vec<_>, _>>()?,
            None => Resolution::DERIVED
                .into_iter()
                .filter(|r| base.divides(*r) && *r != base)
                .collect(),
        };
        Ok(derived)
    }

    pub fn range(&self) -> Result<(i64, i64), String> {
        let start = parse_time_input(&self.run.start)?.timestamp();
        let end = match self.run.end.as_deref() {
            Some(end) => parse_time_input(end)?.timestamp(),
            None => last_closed_open(self.base_resolution()?, Utc::now().timestamp()),
        };
        if start > end {
            return Err(format!("run.start ({start}) must be <= run.end ({end})"));
        }
        Ok((start, end))
    }

    pub fn base_keys(&self) -> Result<Vec<SeriesKey>, String> {
        let base = self.base_resolution()?;
        Ok(self
            .pairs
            .iter()
            .map(|pair| SeriesKey::new(pair.exchange, pair.symbol.trim(), base))
            .collect())
    }

    pub fn exchanges(&self) -> Vec<Exchange> {
        let mut exchanges: Vec<Exchange> = self.pairs.iter().map(|p| p.exchange).collect();
        exchanges.sort();
        exchanges.dedup();
        exchanges
    }

    pub fn rate_limit(&self, exchange: Exchange) -> RateLimitConfig {
        self.rate_limits
            .as_ref()
            .and_then(|limits| {
                limits
                    .iter()
                    .find(|(name, _)| Exchange::parse(name).ok() == Some(exchange))
                    .map(|(_, limit)| *limit)
            })
            .unwrap_or_else(|| RateLimitConfig::default_for(exchange))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        let Some(retry) = self.retry.as_ref() else {
            return defaults;
        };
        RetryPolicy {
            max_retries: retry.max_retries.unwrap_or(defaults.max_retries),
            base_delay: retry
                .base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: retry
                .max_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(
            self.http
                .as_ref()
                .and_then(|h| h.timeout_ms)
                .unwrap_or(10_000),
        )
    }

    pub fn base_url(&self, exchange: Exchange) -> String {
        let configured = self.http.as_ref().and_then(|h| match exchange {
            Exchange::BinanceFutures => h.binance_base_url.clone(),
            Exchange::DydxV4 => h.dydx_base_url.clone(),
        });
        configured.unwrap_or_else(|| match exchange {
            Exchange::BinanceFutures => DEFAULT_BINANCE_BASE_URL.to_string(),
            Exchange::DydxV4 => DEFAULT_DYDX_BASE_URL.to_string(),
        })
    }

    pub fn user_agent(&self) -> Option<String> {
        self.http.as_ref().and_then(|h| h.user_agent.clone())
    }

    pub fn quality_limits(&self) -> QualityLimits {
        let dq = self.data_quality.clone().unwrap_or_default();
        QualityLimits {
            max_gaps: dq.max_gaps,
            max_missing_buckets: dq.max_missing_buckets,
            max_duplicates: dq.max_duplicates,
            max_outliers: dq.max_outliers,
            max_partial: dq.max_partial,
        }
    }

    pub fn out_dir(&self) -> PathBuf {
        PathBuf::from(&self.paths.out_dir)
    }

    pub fn dead_letter_path(&self) -> PathBuf {
        match self.paths.dead_letter_path.as_deref() {
            Some(path) => PathBuf::from(path),
            None => self.out_dir().join("dead_letters.jsonl"),
        }
    }

    pub fn store_table(&self) -> &str {
        self.store.table.as_deref().unwrap_or(DEFAULT_TABLE)
    }

    pub fn derived_table(&self) -> &str {
        self.store.derived_table.as_deref().unwrap_or(DEFAULT_DERIVED_TABLE)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.run.run_id.trim().is_empty() {
            return Err("run.run_id must not be empty".to_string());
        }
        if self.pairs.is_empty() {
            return Err("at least one [[pairs]] entry is required".to_string());
        }
        for pair in &self.pairs {
            if pair.symbol.trim().is_empty() {
                return Err(format!("pairs: empty symbol for {}", pair.exchange));
            }
        }
        self.range()?;

        let base = self.base_resolution()?;
        for derived in self.derived_resolutions()? {
            if derived == base || !base.divides(derived) {
                return Err(format!(
                    "resolutions.derived: {derived} is not a whole multiple of base {base}"
                ));
            }
        }

        if let Some(limits) = self.rate_limits.as_ref() {
            for name in limits.keys() {
                Exchange::parse(name).map_err(|err| format!("rate_limits.{name}: {err}"))?;
            }
        }
        for exchange in self.exchanges() {
            let limit = self.rate_limit(exchange);
            if limit.capacity == 0 {
                return Err(format!("rate_limits.{exchange}.capacity must be > 0"));
            }
            if !limit.refill_per_sec.is_finite() || limit.refill_per_sec < MIN_REFILL_PER_SEC {
                return Err(format!(
                    "rate_limits.{exchange}.refill_per_sec must be finite and >= {MIN_REFILL_PER_SEC}"
                ));
            }
            if limit.workers == Some(0) {
                return Err(format!("rate_limits.{exchange}.workers must be > 0"));
            }
        }

        let retry = self.retry_policy();
        if retry.base_delay > retry.max_delay {
            return Err("retry.base_delay_ms must be <= retry.max_delay_ms".to_string());
        }
        if self.http_timeout().is_zero() {
            return Err("http.timeout_ms must be > 0".to_string());
        }

        if self.store.backend == StoreBackend::Postgres
            && self.store.url.as_deref().map(str::trim).unwrap_or("").is_empty()
        {
            return Err("store.url is required for the postgres backend".to_string());
        }
        if self.store.pool_max_size == Some(0) {
            return Err("store.pool_max_size must be > 0".to_string());
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config, String> {
    let (config, _source) = load_config_with_source(path)?;
    Ok(config)
}

pub fn load_config_with_source(path: &Path) -> Result<(Config, String), String> {
    let contents = fs::read_to_string(path)
        .map_err(|err| format!("failed to read config {}: {}", path.display(), err))?;
    let config = toml::from_str(&contents)
        .map_err(|err| format!("failed to parse TOML {}: {}", path.display(), err))?;
    Ok((config, contents))
}

pub fn to_toml_pretty(config: &Config) -> Result<String, String> {
    toml::to_string_pretty(config)
        .map_err(|err| format!("failed to serialize config as TOML: {err}"))
}

/// Accepts RFC3339 or an epoch value; values above 10^12 are taken as milliseconds.
pub fn parse_time_input(value: &str) -> Result<DateTime<Utc>, String> {
    let value = value.trim();
    if let Ok(ts) = value.parse::<i64>() {
        let seconds = if ts > 1_000_000_000_000 { ts / 1000 } else { ts };
        return Utc
            .timestamp_opt(seconds, 0)
            .single()
            .ok_or_else(|| format!("invalid epoch: {value}"));
    }

    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| format!("unsupported timestamp format: {value}"))
}
