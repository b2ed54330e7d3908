use kline_domain::errors::StoreError;
use kline_domain::repositories::candle_store::{AppendOutcome, CandleStore, StoredCandle};
use kline_domain::value_objects::candle::Candle;
use kline_domain::value_objects::exchange::Exchange;
use kline_domain::value_objects::resolution::Resolution;
use kline_domain::value_objects::series::{SeriesKey, TimeSeries};
use super::postgres_derived::PostgresDerivedStore;
use postgres::NoTls;
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::PostgresConnectionManager;
use std::time::Instant;

pub(crate) type Manager = PostgresConnectionManager<NoTls>;

/// Append-only candle log in Postgres. One row per `(key, open_time, revision)`; the
/// highest revision of a bucket is the active one.
#[derive(Debug, Clone)]
pub struct PostgresCandleStore {
    pool: Pool<Manager>,
    pub table: String,
}

impl PostgresCandleStore {
    pub fn new(db_url: &str, table: String, pool_max_size: u32) -> Result<Self, String> {
        if let Err(err) = validate_table_name(&table) {
            return Err(format!("invalid candle table '{}': {}", table, err));
        }

        let config = db_url
            .parse::<postgres::Config>()
            .map_err(|err| format!("invalid postgres db url: {err}"))?;
        let manager = PostgresConnectionManager::new(config, NoTls);
        let pool = Pool::builder()
            .max_size(pool_max_size)
            .build(manager)
            .map_err(|err| format!("failed to build postgres pool: {err}"))?;

        Ok(Self { pool, table })
    }

    /// Creates the candle table and its indexes when missing.
    pub fn migrate(&self) -> Result<(), String> {
        self.execute_batch(&create_table_sql(&self.table))
    }

    pub fn execute_batch(&self, sql: &str) -> Result<(), String> {
        let mut client = self.checkout().map_err(|err| err.to_string())?;
        client
            .batch_execute(sql)
            .map_err(|err| format!("failed to execute migrations: {err}"))?;
        tracing::info!(table = %self.table, "candle schema applied");
        Ok(())
    }

    fn checkout(&self) -> Result<PooledConnection<Manager>, StoreError> {
        checkout(&self.pool)
    }

    /// Derived-series table on the same pool.
    pub fn derived_store(&self, table: String) -> Result<PostgresDerivedStore, String> {
        PostgresDerivedStore::with_pool(self.pool.clone(), table)
    }

    fn fetch_active(
        &self,
        client: &mut PooledConnection<Manager>,
        candle: &Candle,
    ) -> Result<Option<Candle>, StoreError> {
        let sql = format!(
            "SELECT open, high, low, close, volume, source_seq FROM {} \
             WHERE exchange=$1 AND symbol=$2 AND resolution=$3 AND open_time=$4 \
             ORDER BY revision DESC LIMIT 1",
            self.table
        );
        let rows = client
            .query(
                &sql,
                &[
                    &candle.exchange.id(),
                    &candle.symbol,
                    &candle.resolution.label(),
                    &candle.open_time,
                ],
            )
            .map_err(|err| backend("select active candle", err))?;
        Ok(rows.first().map(|row| Candle {
            exchange: candle.exchange,
            symbol: candle.symbol.clone(),
            resolution: candle.resolution,
            open_time: candle.open_time,
            open: row.get(0),
            high: row.get(1),
            low: row.get(2),
            close: row.get(3),
            volume: row.get(4),
            source_seq: row.get::<_, Option<i64>>(5).map(|seq| seq as u64),
        }))
    }
}

pub(crate) fn checkout(pool: &Pool<Manager>) -> Result<PooledConnection<Manager>, StoreError> {
    let get_start = Instant::now();
    match pool.get() {
        Ok(client) => {
            metrics::histogram!("kline.infra.postgres.pool.get_ms")
                .record(get_start.elapsed().as_secs_f64() * 1000.0);
            Ok(client)
        }
        Err(err) => {
            metrics::counter!("kline.infra.postgres.pool.get.errors_total").increment(1);
            tracing::error!(error = %err, "failed to checkout postgres connection");
            Err(StoreError::Backend(format!(
                "failed to checkout postgres connection: {err}"
            )))
        }
    }
}

pub(crate) fn backend(stage: &'static str, err: postgres::Error) -> StoreError {
    metrics::counter!("kline.infra.postgres.errors_total", "stage" => stage).increment(1);
    tracing::error!(error = %err, stage, "postgres statement failed");
    StoreError::Backend(format!("failed to {stage}: {err}"))
}

pub(crate) fn record_call<T>(op: &'static str, started: Instant, result: &Result<T, StoreError>) {
    let label = if result.is_ok() { "ok" } else { "err" };
    metrics::counter!("kline.infra.postgres.calls_total", "op" => op, "result" => label)
        .increment(1);
    metrics::histogram!("kline.infra.postgres.call_ms", "op" => op)
        .record(started.elapsed().as_secs_f64() * 1000.0);
}

impl CandleStore for PostgresCandleStore {
    fn append(&self, candle: &Candle) -> Result<AppendOutcome, StoreError> {
        if candle.check_alignment().is_err() {
            return Ok(AppendOutcome::OutOfOrderRejected);
        }
        let started = Instant::now();
        let result = (|| -> Result<AppendOutcome, StoreError> {
            let mut client = self.checkout()?;
            let sql = format!(
                "INSERT INTO {} (exchange, symbol, resolution, open_time, revision, \
                 open, high, low, close, volume, source_seq) \
                 VALUES ($1, $2, $3, $4, 0, $5, $6, $7, $8, $9, $10) \
                 ON CONFLICT (exchange, symbol, resolution, open_time, revision) DO NOTHING",
                self.table
            );
            let source_seq = candle.source_seq.map(|seq| seq as i64);
            let inserted = client
                .execute(
                    &sql,
                    &[
                        &candle.exchange.id(),
                        &candle.symbol,
                        &candle.resolution.label(),
                        &candle.open_time,
                        &candle.open,
                        &candle.high,
                        &candle.low,
                        &candle.close,
                        &candle.volume,
                        &source_seq,
                    ],
                )
                .map_err(|err| backend("insert candle", err))?;
            if inserted == 1 {
                return Ok(AppendOutcome::Inserted);
            }
            let existing = self.fetch_active(&mut client, candle)?.ok_or_else(|| {
                StoreError::Backend(format!(
                    "insert for {} at {} was skipped but no row exists",
                    candle.key(),
                    candle.open_time
                ))
            })?;
            if existing.same_values(candle) {
                Ok(AppendOutcome::DuplicateIgnored)
            } else {
                Err(StoreError::Conflict {
                    key: candle.key(),
                    open_time: candle.open_time,
                    existing: Box::new(existing),
                    incoming: Box::new(candle.clone()),
                })
            }
        })();
        record_call("append", started, &result);
        result
    }

    fn query(&self, key: &SeriesKey, start: i64, end: i64) -> Result<TimeSeries, StoreError> {
        if start > end {
            return Ok(TimeSeries::empty(key.clone()));
        }
        let span = tracing::info_span!(
            "infra.postgres.query_candles",
            table = %self.table,
            key = %key,
            start,
            end
        );
        let _enter = span.enter();
        let started = Instant::now();
        let result = (|| -> Result<TimeSeries, StoreError> {
            let mut client = self.checkout()?;
            let sql = format!(
                "SELECT DISTINCT ON (open_time) open_time, open, high, low, close, volume, source_seq \
                 FROM {} WHERE exchange=$1 AND symbol=$2 AND resolution=$3 \
                 AND open_time >= $4 AND open_time <= $5 \
                 ORDER BY open_time ASC, revision DESC",
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
                .map_err(|err| backend("query candles", err))?;
            let candles: Vec<Candle> = rows
                .iter()
                .map(|row| Candle {
                    exchange: key.exchange,
                    symbol: key.symbol.clone(),
                    resolution: key.resolution,
                    open_time: row.get(0),
                    open: row.get(1),
                    high: row.get(2),
                    low: row.get(3),
                    close: row.get(4),
                    volume: row.get(5),
                    source_seq: row.get::<_, Option<i64>>(6).map(|seq| seq as u64),
                })
                .collect();
            metrics::counter!("kline.infra.postgres.query.rows_total")
                .increment(candles.len() as u64);
            tracing::debug!(rows = candles.len(), "loaded candles");
            Ok(TimeSeries::new(key.clone(), candles))
        })();
        record_call("query", started, &result);
        result
    }

    fn supersede(&self, candle: &Candle, reason: &str) -> Result<(), StoreError> {
        let started = Instant::now();
        let result = (|| -> Result<(), StoreError> {
            let mut client = self.checkout()?;
            let mut tx = client
                .transaction()
                .map_err(|err| backend("start transaction", err))?;
            let select = format!(
                "SELECT revision FROM {} \
                 WHERE exchange=$1 AND symbol=$2 AND resolution=$3 AND open_time=$4 \
                 ORDER BY revision DESC LIMIT 1 FOR UPDATE",
                self.table
            );
            let exchange = candle.exchange.id();
            let resolution = candle.resolution.label();
            let rows = tx
                .query(
                    &select,
                    &[&exchange, &candle.symbol, &resolution, &candle.open_time],
                )
                .map_err(|err| backend("lock active revision", err))?;
            let current: i32 = match rows.first() {
                Some(row) => row.get(0),
                None => {
                    return Err(StoreError::NotFound {
                        key: candle.key(),
                        open_time: candle.open_time,
                    })
                }
            };
            let next = current + 1;
            let insert = format!(
                "INSERT INTO {} (exchange, symbol, resolution, open_time, revision, \
                 open, high, low, close, volume, source_seq, reason) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
                self.table
            );
            let source_seq = candle.source_seq.map(|seq| seq as i64);
            tx.execute(
                &insert,
                &[
                    &exchange,
                    &candle.symbol,
                    &resolution,
                    &candle.open_time,
                    &next,
                    &candle.open,
                    &candle.high,
                    &candle.low,
                    &candle.close,
                    &candle.volume,
                    &source_seq,
                    &reason,
                ],
            )
            .map_err(|err| backend("insert revision", err))?;
            tx.commit().map_err(|err| backend("commit revision", err))?;
            tracing::info!(
                key = %candle.key(),
                open_time = candle.open_time,
                revision = next,
                reason,
                "candle superseded"
            );
            Ok(())
        })();
        record_call("supersede", started, &result);
        result
    }

    fn keys(&self) -> Result<Vec<SeriesKey>, StoreError> {
        let mut client = self.checkout()?;
        let sql = format!(
            "SELECT DISTINCT exchange, symbol, resolution FROM {} ORDER BY 1, 2, 3",
            self.table
        );
        let rows = client
            .query(&sql, &[])
            .map_err(|err| backend("list keys", err))?;
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

    fn history(&self, key: &SeriesKey, open_time: i64) -> Result<Vec<StoredCandle>, StoreError> {
        let mut client = self.checkout()?;
        let sql = format!(
            "SELECT revision, open, high, low, close, volume, source_seq, reason FROM {} \
             WHERE exchange=$1 AND symbol=$2 AND resolution=$3 AND open_time=$4 \
             ORDER BY revision ASC",
            self.table
        );
        let rows = client
            .query(
                &sql,
                &[
                    &key.exchange.id(),
                    &key.symbol,
                    &key.resolution.label(),
                    &open_time,
                ],
            )
            .map_err(|err| backend("load history", err))?;
        Ok(rows
            .iter()
            .map(|row| StoredCandle {
                revision: row.get::<_, i32>(0) as u32,
                candle: Candle {
                    exchange: key.exchange,
                    symbol: key.symbol.clone(),
                    resolution: key.resolution,
                    open_time,
                    open: row.get(1),
                    high: row.get(2),
                    low: row.get(3),
                    close: row.get(4),
                    volume: row.get(5),
                    source_seq: row.get::<_, Option<i64>>(6).map(|seq| seq as u64),
                },
                reason: row.get(7),
            })
            .collect())
    }
}

pub fn create_table_sql(table: &str) -> String {
    let index = table.replace('.', "_");
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
    exchange TEXT NOT NULL,
    symbol TEXT NOT NULL,
    resolution TEXT NOT NULL,
    open_time BIGINT NOT NULL,
    revision INTEGER NOT NULL DEFAULT 0,
    open DOUBLE PRECISION NOT NULL,
    high DOUBLE PRECISION NOT NULL,
    low DOUBLE PRECISION NOT NULL,
    close DOUBLE PRECISION NOT NULL,
    volume DOUBLE PRECISION NOT NULL,
    source_seq BIGINT,
    reason TEXT,
    ingested_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (exchange, symbol, resolution, open_time, revision)
);
CREATE INDEX IF NOT EXISTS {index}_active_idx
    ON {table} (exchange, symbol, resolution, open_time, revision DESC);
"
    )
}

pub(crate) fn validate_table_name(table: &str) -> Result<(), String> {
    if table.is_empty() {
        return Err("table name is empty".to_string());
    }
    let parts: Vec<&str> = table.split('.').collect();
    if parts.len() > 2 {
        return Err(format!("invalid table name: {table}"));
    }
    for part in parts {
        let mut chars = part.chars();
        let valid_start = chars
            .next()
            .map(|ch| ch.is_ascii_alphabetic() || ch == '_')
            .unwrap_or(false);
        if !valid_start || !chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
            return Err(format!("invalid table name: {table}"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{create_table_sql, validate_table_name, PostgresCandleStore};

    #[test]
    fn validate_table_name_accepts_schema() {
        assert!(validate_table_name("kline_candles").is_ok());
        assert!(validate_table_name("market.kline_candles").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("a.b.c").is_err());
        assert!(validate_table_name("kline;drop").is_err());
        assert!(validate_table_name("1candles").is_err());
        assert!(validate_table_name("market.").is_err());
    }

    #[test]
    fn new_rejects_invalid_table_before_connect() {
        let err = PostgresCandleStore::new("postgres://invalid", "kline;drop".to_string(), 1)
            .expect_err("invalid table name");
        assert!(err.contains("invalid table name"));
    }

    #[test]
    fn new_errors_on_invalid_db_url() {
        let err = PostgresCandleStore::new("not a url", "kline_candles".to_string(), 1)
            .expect_err("invalid db url should fail fast");
        assert!(err.contains("invalid postgres db url"));
    }

    #[test]
    fn schema_matches_shipped_migration() {
        let shipped = include_str!("../../../ops/migrations/0001_create_kline_candles.sql");
        assert_eq!(create_table_sql("kline_candles").trim(), shipped.trim());
    }

    #[test]
    fn schema_index_name_flattens_schema_prefix() {
        let sql = create_table_sql("market.kline_candles");
        assert!(sql.contains("market_kline_candles_active_idx"));
        assert!(sql.contains("PRIMARY KEY (exchange, symbol, resolution, open_time, revision)"));
    }
}
