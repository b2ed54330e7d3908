use crate::errors::StoreError;
use crate::value_objects::candle::DerivedCandle;
use crate::value_objects::series::SeriesKey;
use serde::Serialize;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub unchanged: usize,
    pub replaced: usize,
}

impl UpsertSummary {
    pub fn record(&mut self, existing: Option<&DerivedCandle>, incoming: &DerivedCandle) -> bool {
        match existing {
            Some(current) if current.same_values(incoming) => {
                self.unchanged += 1;
                false
            }
            Some(_) => {
                self.replaced += 1;
                true
            }
            None => {
                self.inserted += 1;
                true
            }
        }
    }
}

/// Persisted resampler output, one row per `(exchange, symbol, resolution, open_time)`.
/// Writes compare by value, so re-running a range only touches buckets that changed
/// (for example partial to complete after a backfill).
pub trait DerivedCandleStore: Send + Sync {
    fn upsert(&self, key: &SeriesKey, candles: &[DerivedCandle]) -> Result<UpsertSummary, StoreError>;

    /// Buckets with `open_time` in `[start, end]`, ascending.
    fn range(&self, key: &SeriesKey, start: i64, end: i64) -> Result<Vec<DerivedCandle>, StoreError>;

    fn keys(&self) -> Result<Vec<SeriesKey>, StoreError>;
}
