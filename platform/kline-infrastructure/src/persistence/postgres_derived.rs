use super::postgres_store::{backend, checkout, record_call, validate_table_name, Manager};
use kline_domain::errors::StoreError;
use kline_domain::repositories::derived_store::{DerivedCandleStore, UpsertSummary};
use kline_domain::value_objects::candle::{Candle, Completeness, DerivedCandle};
use kline_domain::value_objects::exchange::Exchange;
use kline_domain::value_objects::resolution::Resolution;
use kline_domain::value_objects::series::SeriesKey;
use postgres::Row;
use r2d2::Pool;
use std::collections::BTreeMap;
use std::time::Instant;

/// Derived buckets keyed by `(exchange, symbol, resolution, open_time)`. Unlike the base
/// log this table is rewritten in place: a derived bucket is a pure function of the base
/// rows and carries no audit history of its own.
#[derive(Debug, Clone)]
pub struct PostgresDerivedStore {
    pool: Pool<Manager>,
    pub table: String,
}

impl PostgresDerivedStore {
    pub(crate) fn with_pool(pool: Pool<Manager>, table: String) -> Result<Self, String> {
        if let Err(err) = validate_table_name(&table) {
            return Err(format!("invalid derived table '{}': {}", table, err));
        }
        Ok(Self { pool, table })
    }

    pub fn migrate(&self) -> Result<(), String> {
        let mut client = checkout(&self.pool).map_err(|err| err.to_string())?;
        client
            .batch_execute(&create_derived_table_sql(&self.table))
            .map_err(|err| format!("failed to execute migrations: {err}"))?;
        tracing::info!(table = %self.table, "derived candle schema applied");
        Ok(())
    }
}

fn derived_from_row(key: &SeriesKey, row: &Row) -> Result<DerivedCandle, StoreError> {
    let completeness: String = row.get(6);
    let base_count: i64 = row.get(7);
    let expected_count: i64 = row.get(8);
    let count = |value: i64, field: &str| {
        u32::try_from(value)
            .map_err(|_| StoreError::Backend(format!("{field} out of range: {value}")))
    };
    Ok(DerivedCandle {
        candle: Candle {
            exchange: key.exchange,
            symbol: key.symbol.clone(),
            resolution: key.resolution,
            open_time: row.get(0),
            open: row.get(1),
            high: row.get(2),
            low: row.get(3),
            close: row.get(4),
            volume: row.get(5),
            source_seq: None,
        },
        completeness: Completeness::parse(&completeness).map_err(StoreError::Backend)?,
        base_count: count(base_count, "base_count")?,
        expected_count: count(expected_count, "expected_count")?,
    })
}

impl DerivedCandleStore for PostgresDerivedStore {
    fn upsert(&self, key: &SeriesKey, candles: &[DerivedCandle]) -> Result<UpsertSummary, StoreError> {
        let (Some(first), Some(last)) = (
            candles.iter().map(DerivedCandle::open_time).min(),
            candles.iter().map(DerivedCandle::open_time).max(),
        ) else {
            return Ok(UpsertSummary::default());
        };
        let started = Instant::now();
        let result = (|| -> Result<UpsertSummary, StoreError> {
            let mut client = checkout(&self.pool)?;
            let mut tx = client
                .transaction()
                .map_err(|err| backend("start transaction", err))?;
            let exchange = key.exchange.id();
            let resolution = key.resolution.label();

            let select = format!(
                "SELECT open_time, open, high, low, close, volume, completeness, base_count, expected_count \
                 FROM {} WHERE exchange=$1 AND symbol=$2 AND resolution=$3 \
                 AND open_time >= $4 AND open_time <= $5 FOR UPDATE",
                self.table
            );
            let rows = tx
                .query(&select, &[&exchange, &key.symbol, &resolution, &first, &last])
                .map_err(|err| backend("lock derived rows", err))?;
            let mut existing = BTreeMap::new();
            for row in &rows {
                let stored = derived_from_row(key, row)?;
                existing.insert(stored.open_time(), stored);
            }

            let write = format!(
                "INSERT INTO {} (exchange, symbol, resolution, open_time, open, high, low, close, \
                 volume, completeness, base_count, expected_count) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
                 ON CONFLICT (exchange, symbol, resolution, open_time) DO UPDATE SET \
                 open=EXCLUDED.open, high=EXCLUDED.high, low=EXCLUDED.low, close=EXCLUDED.close, \
                 volume=EXCLUDED.volume, completeness=EXCLUDED.completeness, \
                 base_count=EXCLUDED.base_count, expected_count=EXCLUDED.expected_count, \
                 updated_at=NOW()",
                self.table
            );
            let statement = tx
                .prepare(&write)
                .map_err(|err| backend("prepare derived upsert", err))?;
            let mut summary = UpsertSummary::default();
            for candle in candles {
                if !summary.record(existing.get(&candle.open_time()), candle) {
                    continue;
                }
                let base_count = i64::from(candle.base_count);
                let expected_count = i64::from(candle.expected_count);
                tx.execute(
                    &statement,
                    &[
                        &exchange,
                        &key.symbol,
                        &resolution,
                        &candle.open_time(),
                        &candle.candle.open,
                        &candle.candle.high,
                        &candle.candle.low,
                        &candle.candle.close,
                        &candle.candle.volume,
                        &candle.completeness.as_str(),
                        &base_count,
                        &expected_count,
                    ],
                )
                .map_err(|err| backend("upsert derived candle", err))?;
            }
            tx.commit().map_err(|err| backend("commit derived upsert", err))?;
            Ok(summary)
        })();
        record_call("derived_upsert", started, &result);
        result
    }

    fn range(&self, key: &SeriesKey, start: i64, end: i64) -> Result<Vec<DerivedCandle>, StoreError> {
        if start > end {
            return Ok(Vec::new());
        }
        let started = Instant::now();
        let result = (|| -> Result<Vec<DerivedCandle>, StoreError> {
            let mut client = checkout(&self.pool)?;
            let sql = format!(
                "SELECT open_time, open, high, low, close, volume, completeness, base_count, expected_count \
                 FROM {} WHERE exchange=$1 AND symbol=$2 AND resolution=$3 \
                 AND open_time >= $4 AND open_time <= $5 ORDER BY open_time ASC",
                self.table
            );
            let rows = client
                .query(
                    &sql,
                    &[
                        &key.exchange.id(),
                        &key.symbol,
                        &key.resolution.label(),
                        &start,
                        &end,
                    ],
                )
                .map_err(|err| backend("query derived candles", err))?;
            rows.iter().map(|row| derived_from_row(key, row)).collect()
        })();
        record_call("derived_range", started, &result);
        result
    }

    fn keys(&self) -> Result<Vec<SeriesKey>, StoreError> {
        let mut client = checkout(&self.pool)?;
        let sql = format!(
            "SELECT DISTINCT exchange, symbol, resolution FROM {} ORDER BY 1, 2, 3",
            self.table
        );
        let rows = client
            .query(&sql, &[])
            .map_err(|err| backend("list derived keys", err))?;
        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            let exchange: String = row.get(0);
            let symbol: String = row.get(1);
            let resolution: String = row.get(2);
            let exchange = Exchange::parse(&exchange).map_err(StoreError::Backend)?;
            let resolution = Resolution::parse(&resolution).map_err(StoreError::Backend)?;
            keys.push(SeriesKey::new(exchange, symbol, resolution));
        }
        keys.sort();
        Ok(keys)
    }
}

pub fn create_derived_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
    exchange TEXT NOT NULL,
    symbol TEXT NOT NULL,
    resolution TEXT NOT NULL,
    open_time BIGINT NOT NULL,
    open DOUBLE PRECISION NOT NULL,
    high DOUBLE PRECISION NOT NULL,
    low DOUBLE PRECISION NOT NULL,
    close DOUBLE PRECISION NOT NULL,
    volume DOUBLE PRECISION NOT NULL,
    completeness TEXT NOT NULL CHECK (completeness IN ('complete', 'partial')),
    base_count BIGINT NOT NULL,
    expected_count BIGINT NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (exchange, symbol, resolution, open_time)
);
"
    )
}
