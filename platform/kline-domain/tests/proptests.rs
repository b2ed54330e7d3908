use kline_domain::errors::SchemaError;
use kline_domain::services::normalizer::normalize;
use kline_domain::services::resampler::{resample, resample_derived};
use kline_domain::services::validator::{validate_series, VenueProfile};
use kline_domain::value_objects::candle::Candle;
use kline_domain::value_objects::exchange::Exchange;
use kline_domain::value_objects::raw_record::{BinanceKline, RawRecord};
use kline_domain::value_objects::resolution::Resolution;
use kline_domain::value_objects::series::{SeriesKey, TimeSeries};
use proptest::prelude::*;

fn key() -> SeriesKey {
    SeriesKey::new(Exchange::BinanceFutures, "BTCUSDT", Resolution::M1)
}

fn candle(open_time: i64, price: u32, volume: u32) -> Candle {
    let open = f64::from(price);
    Candle {
        exchange: Exchange::BinanceFutures,
        symbol: "BTCUSDT".to_string(),
        resolution: Resolution::M1,
        open_time,
        open,
        high: open + 2.0,
        low: open - 1.0,
        close: open + 1.0,
        volume: f64::from(volume),
        source_seq: None,
    }
}

/// Minutes of a 2h range starting at an epoch-aligned half hour, with some removed.
fn holed_series(present: &[bool], prices: &[u32], volumes: &[u32]) -> TimeSeries {
    let base = 1_700_000_000 - 1_700_000_000 % 1_800;
    let candles = present
        .iter()
        .enumerate()
        .filter(|(_, keep)| **keep)
        .map(|(minute, _)| candle(base + minute as i64 * 60, prices[minute], volumes[minute]))
        .collect();
    TimeSeries::new(key(), candles)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn normalized_open_times_are_always_aligned(open_time_ms in 0i64..4_000_000_000_000) {
        let record = RawRecord::Binance(BinanceKline {
            open_time_ms: Some(open_time_ms),
            open: Some("10".to_string()),
            high: Some("11".to_string()),
            low: Some("9".to_string()),
            close: Some("10.5".to_string()),
            volume: Some("1".to_string()),
            ..BinanceKline::default()
        });
        match normalize(&record, &key()) {
            Ok(candle) => prop_assert_eq!(candle.open_time % 60, 0),
            Err(err) => prop_assert!(matches!(err, SchemaError::Misaligned { .. }), "unexpected error: {:?}", err),
        }
    }

    #[test]
    fn resampling_is_deterministic(
        present in prop::collection::vec(any::<bool>(), 120),
        prices in prop::collection::vec(10u32..10_000, 120),
        volumes in prop::collection::vec(0u32..1_000, 120),
    ) {
        let series = holed_series(&present, &prices, &volumes);
        let first = resample(&series, Resolution::M15).unwrap();
        let second = resample(&series, Resolution::M15).unwrap();
        prop_assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }

    #[test]
    fn chained_resampling_matches_direct(
        present in prop::collection::vec(prop::bool::weighted(0.9), 120),
        prices in prop::collection::vec(10u32..10_000, 120),
        volumes in prop::collection::vec(0u32..1_000, 120),
    ) {
        let series = holed_series(&present, &prices, &volumes);
        let direct = resample(&series, Resolution::M30).unwrap();
        let m5 = resample(&series, Resolution::M5).unwrap();
        let chained = resample_derived(&key().with_resolution(Resolution::M5), &m5, Resolution::M30).unwrap();
        prop_assert_eq!(direct, chained);
    }

    #[test]
    fn gap_buckets_match_removed_interior_minutes(
        present in prop::collection::vec(any::<bool>(), 2..200),
    ) {
        let prices = vec![100u32; present.len()];
        let volumes = vec![1u32; present.len()];
        let series = holed_series(&present, &prices, &volumes);
        let report = validate_series(&series, &VenueProfile::for_exchange(Exchange::BinanceFutures));

        let first = present.iter().position(|p| *p);
        let last = present.iter().rposition(|p| *p);
        let expected_missing = match (first, last) {
            (Some(first), Some(last)) => present[first..=last].iter().filter(|p| !**p).count() as i64,
            _ => 0,
        };
        prop_assert_eq!(report.missing_buckets, expected_missing);
        prop_assert_eq!(report.rows, series.len());
        prop_assert!(report.ordering_violations.is_empty());
    }
}
