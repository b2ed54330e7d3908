use crate::errors::SchemaError;
use crate::value_objects::exchange::Exchange;
use crate::value_objects::resolution::Resolution;
use crate::value_objects::series::SeriesKey;
use serde::{Deserialize, Serialize};

/// Canonical K-line. `open_time` is epoch seconds and always sits on a `resolution` boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub exchange: Exchange,
    pub symbol: String,
    pub resolution: Resolution,
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub source_seq: Option<u64>,
}

impl Candle {
    pub fn key(&self) -> SeriesKey {
        SeriesKey::new(self.exchange, self.symbol.clone(), self.resolution)
    }

    pub fn belongs_to(&self, key: &SeriesKey) -> bool {
        self.exchange == key.exchange
            && self.resolution == key.resolution
            && self.symbol == key.symbol
    }

    pub fn close_time(&self) -> i64 {
        self.open_time + self.resolution.seconds() - 1
    }

    /// True once the bucket has fully elapsed at `now` (epoch seconds); before that the
    /// venue is still revising it.
    pub fn is_closed_at(&self, now: i64) -> bool {
        self.open_time.saturating_add(self.resolution.seconds()) <= now
    }

    /// Identity comparison used for dedup: OHLCV must match bit for bit, `source_seq` is ignored.
    pub fn same_values(&self, other: &Candle) -> bool {
        self.open.to_bits() == other.open.to_bits()
            && self.high.to_bits() == other.high.to_bits()
            && self.low.to_bits() == other.low.to_bits()
            && self.close.to_bits() == other.close.to_bits()
            && self.volume.to_bits() == other.volume.to_bits()
    }

    pub fn check_alignment(&self) -> Result<(), SchemaError> {
        if self.resolution.is_aligned(self.open_time) {
            Ok(())
        } else {
            Err(SchemaError::Misaligned {
                open_time: self.open_time,
                resolution: self.resolution,
            })
        }
    }

    pub fn check_invariants(&self) -> Result<(), SchemaError> {
        self.check_alignment()?;
        for (field, value) in [
            ("open", self.open),
            ("high", self.high),
            ("low", self.low),
            ("close", self.close),
            ("volume", self.volume),
        ] {
            if !value.is_finite() {
                return Err(SchemaError::OutOfRange(format!("{field} is not finite")));
            }
        }
        if self.open <= 0.0 || self.close <= 0.0 || self.low <= 0.0 {
            return Err(SchemaError::OutOfRange("prices must be > 0".to_string()));
        }
        if self.volume < 0.0 {
            return Err(SchemaError::OutOfRange(format!(
                "negative volume {}",
                self.volume
            )));
        }
        if self.high < self.low {
            return Err(SchemaError::OutOfRange(format!(
                "high {} < low {}",
                self.high, self.low
            )));
        }
        if self.high < self.open.max(self.close) || self.low > self.open.min(self.close) {
            return Err(SchemaError::OutOfRange(format!(
                "open/close outside high/low range (o={} h={} l={} c={})",
                self.open, self.high, self.low, self.close
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Completeness {
    Complete,
    Partial,
}

impl Completeness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Completeness::Complete => "complete",
            Completeness::Partial => "partial",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value {
            "complete" => Ok(Completeness::Complete),
            "partial" => Ok(Completeness::Partial),
            other => Err(format!("unknown completeness: {other}")),
        }
    }
}

/// Candle at a derived resolution, tagged with how much of its base range was present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedCandle {
    pub candle: Candle,
    pub completeness: Completeness,
    pub base_count: u32,
    pub expected_count: u32,
}

impl DerivedCandle {
    pub fn is_complete(&self) -> bool {
        self.completeness == Completeness::Complete
    }

    pub fn open_time(&self) -> i64 {
        self.candle.open_time
    }

    /// Value identity for upserts: OHLCV plus the completeness tag and counts.
    pub fn same_values(&self, other: &DerivedCandle) -> bool {
        self.completeness == other.completeness
            && self.base_count == other.base_count
            && self.expected_count == other.expected_count
            && self.candle.same_values(&other.candle)
    }
}
