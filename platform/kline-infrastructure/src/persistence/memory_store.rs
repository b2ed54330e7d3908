use kline_domain::errors::StoreError;
use kline_domain::repositories::candle_store::{AppendOutcome, CandleStore, StoredCandle};
use kline_domain::value_objects::candle::Candle;
use kline_domain::value_objects::series::{SeriesKey, TimeSeries};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

type Revisions = Vec<StoredCandle>;

/// Process-local store. Every bucket keeps its full revision log; the last entry is active.
#[derive(Debug, Default)]
pub struct InMemoryCandleStore {
    series: Mutex<HashMap<SeriesKey, BTreeMap<i64, Revisions>>>,
}

impl InMemoryCandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.series.lock().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn active(revisions: &Revisions) -> Option<&StoredCandle> {
    revisions.last()
}

impl CandleStore for InMemoryCandleStore {
    fn append(&self, candle: &Candle) -> Result<AppendOutcome, StoreError> {
        if candle.check_alignment().is_err() {
            return Ok(AppendOutcome::OutOfOrderRejected);
        }
        let mut series = self.series.lock();
        let buckets = series.entry(candle.key()).or_default();
        if let Some(current) = buckets.get(&candle.open_time).and_then(active) {
            if current.candle.same_values(candle) {
                return Ok(AppendOutcome::DuplicateIgnored);
            }
            return Err(StoreError::Conflict {
                key: candle.key(),
                open_time: candle.open_time,
                existing: Box::new(current.candle.clone()),
                incoming: Box::new(candle.clone()),
            });
        }
        buckets.insert(
            candle.open_time,
            vec![StoredCandle {
                candle: candle.clone(),
                revision: 0,
                reason: None,
            }],
        );
        Ok(AppendOutcome::Inserted)
    }

    fn query(&self, key: &SeriesKey, start: i64, end: i64) -> Result<TimeSeries, StoreError> {
        if start > end {
            return Ok(TimeSeries::empty(key.clone()));
        }
        let series = self.series.lock();
        let candles = series
            .get(key)
            .map(|buckets| {
                buckets
                    .range(start..=end)
                    .filter_map(|(_, revisions)| active(revisions))
                    .map(|stored| stored.candle.clone())
                    .collect()
            })
            .unwrap_or_default();
        Ok(TimeSeries::new(key.clone(), candles))
    }

    fn supersede(&self, candle: &Candle, reason: &str) -> Result<(), StoreError> {
        let mut series = self.series.lock();
        let revisions = series
            .get_mut(&candle.key())
            .and_then(|buckets| buckets.get_mut(&candle.open_time))
            .ok_or_else(|| StoreError::NotFound {
                key: candle.key(),
                open_time: candle.open_time,
            })?;
        let next = revisions.last().map(|r| r.revision + 1).unwrap_or(0);
        revisions.push(StoredCandle {
            candle: candle.clone(),
            revision: next,
            reason: Some(reason.to_string()),
        });
        tracing::info!(
            key = %candle.key(),
            open_time = candle.open_time,
            revision = next,
            reason,
            "candle superseded"
        );
        Ok(())
    }

    fn keys(&self) -> Result<Vec<SeriesKey>, StoreError> {
        let mut keys: Vec<SeriesKey> = self.series.lock().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    fn history(&self, key: &SeriesKey, open_time: i64) -> Result<Vec<StoredCandle>, StoreError> {
        Ok(self
            .series
            .lock()
            .get(key)
            .and_then(|buckets| buckets.get(&open_time))
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kline_domain::value_objects::exchange::Exchange;
    use kline_domain::value_objects::resolution::Resolution;

    fn candle(open_time: i64, close: f64) -> Candle {
        Candle {
            exchange: Exchange::BinanceFutures,
            symbol: "BTCUSDT".to_string(),
            resolution: Resolution::M1,
            open_time,
            open: 100.0,
            high: 110.0,
            low: 90.0,
            close,
            volume: 5.0,
            source_seq: Some(7),
        }
    }

    #[test]
    fn identical_replay_is_ignored() {
        let store = InMemoryCandleStore::new();
        assert_eq!(store.append(&candle(60, 105.0)).unwrap(), AppendOutcome::Inserted);
        let mut replay = candle(60, 105.0);
        replay.source_seq = Some(8);
        assert_eq!(store.append(&replay).unwrap(), AppendOutcome::DuplicateIgnored);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn differing_values_conflict_and_keep_original() {
        let store = InMemoryCandleStore::new();
        store.append(&candle(60, 105.0)).unwrap();
        let err = store.append(&candle(60, 106.0)).unwrap_err();
        match err {
            StoreError::Conflict {
                existing, incoming, ..
            } => {
                assert_eq!(existing.close, 105.0);
                assert_eq!(incoming.close, 106.0);
            }
            other => panic!("unexpected error: {other}"),
        }
        let series = store.query(&candle(60, 0.0).key(), 0, 120).unwrap();
        assert_eq!(series.candles[0].close, 105.0);
    }

    #[test]
    fn misaligned_candles_are_refused() {
        let store = InMemoryCandleStore::new();
        assert_eq!(
            store.append(&candle(61, 105.0)).unwrap(),
            AppendOutcome::OutOfOrderRejected
        );
        assert!(store.is_empty());
    }

    #[test]
    fn late_arrivals_are_merged_in_order() {
        let store = InMemoryCandleStore::new();
        for ts in [180, 60, 120, 0] {
            store.append(&candle(ts, 105.0)).unwrap();
        }
        let key = candle(0, 0.0).key();
        let series = store.query(&key, 0, 180).unwrap();
        assert!(series.is_strictly_increasing());
        assert_eq!(series.len(), 4);
        assert_eq!(store.query(&key, 60, 120).unwrap().len(), 2);
        assert!(store.query(&key, 200, 100).unwrap().is_empty());
    }

    #[test]
    fn supersede_appends_a_revision_and_query_sees_it() {
        let store = InMemoryCandleStore::new();
        store.append(&candle(60, 105.0)).unwrap();
        store.supersede(&candle(60, 104.0), "venue restatement").unwrap();

        let key = candle(60, 0.0).key();
        assert_eq!(store.query(&key, 60, 60).unwrap().candles[0].close, 104.0);
        let history = store.history(&key, 60).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].revision, 0);
        assert_eq!(history[1].revision, 1);
        assert_eq!(history[1].reason.as_deref(), Some("venue restatement"));
        // The corrected values are now the dedup reference.
        assert_eq!(
            store.append(&candle(60, 104.0)).unwrap(),
            AppendOutcome::DuplicateIgnored
        );
    }

    #[test]
    fn supersede_requires_an_existing_bucket() {
        let store = InMemoryCandleStore::new();
        let err = store.supersede(&candle(60, 104.0), "fix").unwrap_err();
        assert!(matches!(err, StoreError::NotFound { open_time: 60, .. }));
    }
}
