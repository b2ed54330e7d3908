use kline_domain::errors::StoreError;
use kline_domain::repositories::derived_store::{DerivedCandleStore, UpsertSummary};
use kline_domain::value_objects::candle::DerivedCandle;
use kline_domain::value_objects::series::SeriesKey;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

/// Process-local derived series, paired with [`super::InMemoryCandleStore`].
#[derive(Debug, Default)]
pub struct InMemoryDerivedStore {
    series: RwLock<HashMap<SeriesKey, BTreeMap<i64, DerivedCandle>>>,
}

impl InMemoryDerivedStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DerivedCandleStore for InMemoryDerivedStore {
    fn upsert(&self, key: &SeriesKey, candles: &[DerivedCandle]) -> Result<UpsertSummary, StoreError> {
        let mut summary = UpsertSummary::default();
        let mut guard = self.series.write();
        let buckets = guard.entry(key.clone()).or_default();
        for candle in candles {
            if summary.record(buckets.get(&candle.open_time()), candle) {
                buckets.insert(candle.open_time(), candle.clone());
            }
        }
        Ok(summary)
    }

    fn range(&self, key: &SeriesKey, start: i64, end: i64) -> Result<Vec<DerivedCandle>, StoreError> {
        if start > end {
            return Ok(Vec::new());
        }
        Ok(self
            .series
            .read()
            .get(key)
            .map(|buckets| buckets.range(start..=end).map(|(_, c)| c.clone()).collect())
            .unwrap_or_default())
    }

    fn keys(&self) -> Result<Vec<SeriesKey>, StoreError> {
        let mut keys: Vec<SeriesKey> = self.series.read().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kline_domain::value_objects::candle::{Candle, Completeness};
    use kline_domain::value_objects::exchange::Exchange;
    use kline_domain::value_objects::resolution::Resolution;

    fn key() -> SeriesKey {
        SeriesKey::new(Exchange::DydxV4, "ETH-USD", Resolution::M5)
    }

    fn derived(open_time: i64, base_count: u32) -> DerivedCandle {
        DerivedCandle {
            candle: Candle {
                exchange: Exchange::DydxV4,
                symbol: "ETH-USD".to_string(),
                resolution: Resolution::M5,
                open_time,
                open: 3000.0,
                high: 3010.0,
                low: 2995.0,
                close: 3005.0,
                volume: f64::from(base_count),
                source_seq: None,
            },
            completeness: if base_count == 5 {
                Completeness::Complete
            } else {
                Completeness::Partial
            },
            base_count,
            expected_count: 5,
        }
    }

    #[test]
    fn rerun_is_unchanged_and_backfill_replaces() {
        let store = InMemoryDerivedStore::new();
        let first = store.upsert(&key(), &[derived(0, 4), derived(300, 5)]).unwrap();
        assert_eq!(first, UpsertSummary { inserted: 2, unchanged: 0, replaced: 0 });

        let rerun = store.upsert(&key(), &[derived(0, 4), derived(300, 5)]).unwrap();
        assert_eq!(rerun, UpsertSummary { inserted: 0, unchanged: 2, replaced: 0 });

        let backfill = store.upsert(&key(), &[derived(0, 5)]).unwrap();
        assert_eq!(backfill.replaced, 1);
        assert!(store.range(&key(), 0, 0).unwrap()[0].is_complete());
    }

    #[test]
    fn range_is_inclusive_and_ordered() {
        let store = InMemoryDerivedStore::new();
        store
            .upsert(&key(), &[derived(600, 5), derived(0, 5), derived(300, 5)])
            .unwrap();
        let opens: Vec<i64> = store
            .range(&key(), 0, 300)
            .unwrap()
            .iter()
            .map(|c| c.open_time())
            .collect();
        assert_eq!(opens, vec![0, 300]);
        assert!(store.range(&key(), 300, 0).unwrap().is_empty());
        assert_eq!(store.keys().unwrap(), vec![key()]);
    }
}
