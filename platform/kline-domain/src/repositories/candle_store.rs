use crate::errors::StoreError;
use crate::value_objects::candle::Candle;
use crate::value_objects::series::{SeriesKey, TimeSeries};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppendOutcome {
    Inserted,
    DuplicateIgnored,
    OutOfOrderRejected,
}

impl AppendOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppendOutcome::Inserted => "inserted",
            AppendOutcome::DuplicateIgnored => "duplicate_ignored",
            AppendOutcome::OutOfOrderRejected => "out_of_order_rejected",
        }
    }
}

/// One physical row of the append-only log. Revision 0 is the ingested record;
/// operator corrections append revision 1, 2, ... and the highest one is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCandle {
    pub candle: Candle,
    pub revision: u32,
    pub reason: Option<String>,
}

/// Single writer of canonical base candles.
pub trait CandleStore: Send + Sync {
    /// Dedup key is `(exchange, symbol, resolution, open_time)`. Identical OHLCV is a
    /// no-op; differing OHLCV is a [`StoreError::Conflict`] and leaves the stored row
    /// untouched.
    fn append(&self, candle: &Candle) -> Result<AppendOutcome, StoreError>;

    fn append_batch(&self, candles: &[Candle]) -> Vec<Result<AppendOutcome, StoreError>> {
        candles.iter().map(|candle| self.append(candle)).collect()
    }

    /// Active revisions in `[start, end]`, ascending.
    fn query(&self, key: &SeriesKey, start: i64, end: i64) -> Result<TimeSeries, StoreError>;

    /// Appends a correcting revision for an existing bucket.
    fn supersede(&self, candle: &Candle, reason: &str) -> Result<(), StoreError>;

    fn keys(&self) -> Result<Vec<SeriesKey>, StoreError>;

    /// Every revision of one bucket, oldest first.
    fn history(&self, key: &SeriesKey, open_time: i64) -> Result<Vec<StoredCandle>, StoreError>;
}
