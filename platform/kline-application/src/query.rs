use crate::quality::QualityRegistry;
use kline_domain::errors::StoreError;
use kline_domain::repositories::candle_store::CandleStore;
use kline_domain::repositories::derived_store::DerivedCandleStore;
use kline_domain::value_objects::candle::DerivedCandle;
use kline_domain::value_objects::exchange::Exchange;
use kline_domain::value_objects::quality_report::QualityReport;
use kline_domain::value_objects::resolution::Resolution;
use kline_domain::value_objects::series::{SeriesKey, TimeSeries};
use std::sync::Arc;

/// Read side handed to collaborators (research, backtests).
#[derive(Clone)]
pub struct QueryService {
    store: Arc<dyn CandleStore>,
    derived: Arc<dyn DerivedCandleStore>,
    quality: Arc<QualityRegistry>,
    base: Resolution,
}

impl QueryService {
    pub fn new(
        store: Arc<dyn CandleStore>,
        derived: Arc<dyn DerivedCandleStore>,
        quality: Arc<QualityRegistry>,
        base: Resolution,
    ) -> Self {
        Self {
            store,
            derived,
            quality,
            base,
        }
    }

    /// Base resolution comes straight from the store. Derived resolutions only
    /// return complete buckets; use [`QueryService::get_derived_series`] to see partial ones.
    pub fn get_series(
        &self,
        exchange: Exchange,
        symbol: &str,
        resolution: Resolution,
        start: i64,
        end: i64,
    ) -> Result<TimeSeries, StoreError> {
        let key = SeriesKey::new(exchange, symbol, resolution);
        if resolution == self.base {
            return self.store.query(&key, start, end);
        }
        let candles = self
            .derived
            .range(&key, start, end)?
            .into_iter()
            .filter(DerivedCandle::is_complete)
            .map(|derived| derived.candle)
            .collect();
        Ok(TimeSeries::new(key, candles))
    }

    pub fn get_derived_series(
        &self,
        exchange: Exchange,
        symbol: &str,
        resolution: Resolution,
        start: i64,
        end: i64,
    ) -> Result<Vec<DerivedCandle>, StoreError> {
        self.derived
            .range(&SeriesKey::new(exchange, symbol, resolution), start, end)
    }

    pub fn get_quality_report(&self, key: &SeriesKey) -> Option<Arc<QualityReport>> {
        self.quality.get(key)
    }
}
