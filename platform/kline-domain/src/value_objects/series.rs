use crate::value_objects::candle::Candle;
use crate::value_objects::exchange::Exchange;
use crate::value_objects::resolution::Resolution;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub exchange: Exchange,
    pub symbol: String,
    pub resolution: Resolution,
}

impl SeriesKey {
    pub fn new(exchange: Exchange, symbol: impl Into<String>, resolution: Resolution) -> Self {
        Self {
            exchange,
            symbol: symbol.into(),
            resolution,
        }
    }

    pub fn with_resolution(&self, resolution: Resolution) -> Self {
        Self {
            exchange: self.exchange,
            symbol: self.symbol.clone(),
            resolution,
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.exchange, self.symbol, self.resolution)
    }
}

/// Candles for one key in the order they were handed over. Store queries always
/// return strictly increasing series; series built elsewhere may not be, which is
/// what the validator audits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries {
    pub key: SeriesKey,
    pub candles: Vec<Candle>,
}

impl TimeSeries {
    pub fn new(key: SeriesKey, candles: Vec<Candle>) -> Self {
        Self { key, candles }
    }

    pub fn empty(key: SeriesKey) -> Self {
        Self {
            key,
            candles: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn first_open_time(&self) -> Option<i64> {
        self.candles.first().map(|c| c.open_time)
    }

    pub fn last_open_time(&self) -> Option<i64> {
        self.candles.last().map(|c| c.open_time)
    }

    pub fn is_strictly_increasing(&self) -> bool {
        self.candles
            .windows(2)
            .all(|pair| pair[0].open_time < pair[1].open_time)
    }

    /// Number of buckets between the first and last candle, inclusive.
    pub fn expected_buckets(&self) -> usize {
        match (self.first_open_time(), self.last_open_time()) {
            (Some(first), Some(last)) if last >= first => {
                ((last - first) / self.key.resolution.seconds()) as usize + 1
            }
            _ => 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.is_strictly_increasing() && self.expected_buckets() == self.len()
    }
}
