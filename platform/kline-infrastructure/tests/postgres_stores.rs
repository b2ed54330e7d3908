use kline_domain::errors::StoreError;
use kline_domain::repositories::candle_store::{AppendOutcome, CandleStore};
use kline_domain::repositories::derived_store::{DerivedCandleStore, UpsertSummary};
use kline_domain::value_objects::candle::{Candle, Completeness, DerivedCandle};
use kline_domain::value_objects::exchange::Exchange;
use kline_domain::value_objects::resolution::Resolution;
use kline_domain::value_objects::series::SeriesKey;
use kline_infrastructure::persistence::PostgresCandleStore;
use std::time::{SystemTime, UNIX_EPOCH};

// Needs a reachable database: KLINE_DB_RUN_TESTS=1 KLINE_DB_URL=postgres://...
fn should_run_db_tests() -> bool {
    std::env::var("KLINE_DB_RUN_TESTS").ok().as_deref() == Some("1")
}

fn db_url() -> Option<String> {
    std::env::var("KLINE_DB_URL").ok()
}

fn unique_suffix() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("{}_{}", std::process::id(), now)
}

fn open_store(url: &str, suffix: &str) -> PostgresCandleStore {
    let store = PostgresCandleStore::new(url, format!("kline_candles_{suffix}"), 2)
        .expect("connect to test database");
    store.migrate().expect("migrate candles");
    store
}

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
        volume: 4.0,
        source_seq: None,
    }
}

fn derived(open_time: i64, base_count: u32) -> DerivedCandle {
    let mut candle = candle(open_time, 105.0);
    candle.resolution = Resolution::M5;
    DerivedCandle {
        candle,
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
fn derived_series_survive_reopen() {
    if !should_run_db_tests() {
        return;
    }
    let Some(url) = db_url() else {
        return;
    };
    let suffix = unique_suffix();
    let key = SeriesKey::new(Exchange::BinanceFutures, "BTCUSDT", Resolution::M5);
    let table = format!("kline_derived_{suffix}");

    {
        let derived_store = open_store(&url, &suffix)
            .derived_store(table.clone())
            .expect("derived store");
        derived_store.migrate().expect("migrate derived");
        let first = derived_store
            .upsert(&key, &[derived(0, 4), derived(300, 5)])
            .expect("first upsert");
        assert_eq!(first, UpsertSummary { inserted: 2, unchanged: 0, replaced: 0 });
    }

    let reopened = open_store(&url, &suffix)
        .derived_store(table)
        .expect("derived store");
    let rerun = reopened
        .upsert(&key, &[derived(0, 4), derived(300, 5)])
        .expect("rerun upsert");
    assert_eq!(rerun, UpsertSummary { inserted: 0, unchanged: 2, replaced: 0 });

    let backfill = reopened.upsert(&key, &[derived(0, 5)]).expect("backfill");
    assert_eq!(backfill.replaced, 1);
    let stored = reopened.range(&key, 0, 300).expect("range");
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(DerivedCandle::is_complete));
    assert_eq!(reopened.keys().expect("keys"), vec![key]);
}

#[test]
fn supersede_clears_a_conflict() {
    if !should_run_db_tests() {
        return;
    }
    let Some(url) = db_url() else {
        return;
    };
    let store = open_store(&url, &unique_suffix());
    assert_eq!(store.append(&candle(60, 100.0)).unwrap(), AppendOutcome::Inserted);
    assert!(matches!(
        store.append(&candle(60, 105.0)),
        Err(StoreError::Conflict { .. })
    ));

    store
        .supersede(&candle(60, 105.0), "venue restated the bucket")
        .expect("supersede");
    assert_eq!(
        store.append(&candle(60, 105.0)).unwrap(),
        AppendOutcome::DuplicateIgnored
    );
    let history = store.history(&candle(60, 0.0).key(), 60).expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].reason.as_deref(), Some("venue restated the bucket"));
}
