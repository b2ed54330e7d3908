use kline_domain::repositories::candle_store::{AppendOutcome, CandleStore};
use kline_domain::value_objects::candle::Candle;
use kline_domain::value_objects::exchange::Exchange;
use kline_domain::value_objects::resolution::Resolution;
use kline_domain::value_objects::series::SeriesKey;
use kline_infrastructure::persistence::InMemoryCandleStore;
use proptest::prelude::*;

fn key() -> SeriesKey {
    SeriesKey::new(Exchange::BinanceFutures, "BTCUSDT", Resolution::M1)
}

fn candle(minute: i64, price: u32, volume: u32) -> Candle {
    let price = f64::from(price);
    Candle {
        exchange: Exchange::BinanceFutures,
        symbol: "BTCUSDT".to_string(),
        resolution: Resolution::M1,
        open_time: minute * 60,
        open: price,
        high: price + 2.0,
        low: price - 1.0,
        close: price + 1.0,
        volume: f64::from(volume),
        source_seq: None,
    }
}

fn batch() -> impl Strategy<Value = Vec<Candle>> {
    prop::collection::btree_map(0i64..500, (10u32..1000, 0u32..50), 1..80).prop_map(|rows| {
        rows.into_iter()
            .map(|(minute, (price, volume))| candle(minute, price, volume))
            .collect()
    })
}

proptest! {
    #[test]
    fn replaying_a_batch_changes_nothing(candles in batch()) {
        let store = InMemoryCandleStore::new();
        for outcome in store.append_batch(&candles) {
            prop_assert_eq!(outcome.unwrap(), AppendOutcome::Inserted);
        }
        let first = store.query(&key(), i64::MIN, i64::MAX).unwrap();

        for outcome in store.append_batch(&candles) {
            prop_assert_eq!(outcome.unwrap(), AppendOutcome::DuplicateIgnored);
        }
        let second = store.query(&key(), i64::MIN, i64::MAX).unwrap();
        prop_assert_eq!(first, second);
        prop_assert_eq!(store.len(), candles.len());
    }

    #[test]
    fn arrival_order_does_not_change_the_series(candles in batch(), seed in any::<u64>()) {
        let ordered = InMemoryCandleStore::new();
        ordered.append_batch(&candles);

        let mut shuffled = candles.clone();
        // Deterministic rotation plus reversal; enough to exercise late arrivals.
        let pivot = (seed as usize) % shuffled.len();
        shuffled.rotate_left(pivot);
        if seed % 2 == 0 {
            shuffled.reverse();
        }
        let late = InMemoryCandleStore::new();
        late.append_batch(&shuffled);

        let a = ordered.query(&key(), i64::MIN, i64::MAX).unwrap();
        let b = late.query(&key(), i64::MIN, i64::MAX).unwrap();
        prop_assert!(b.is_strictly_increasing());
        prop_assert_eq!(a, b);
    }
}
