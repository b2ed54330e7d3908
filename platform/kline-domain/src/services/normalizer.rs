use crate::errors::SchemaError;
use crate::value_objects::candle::Candle;
use crate::value_objects::exchange::Exchange;
use crate::value_objects::raw_record::{BinanceKline, DydxCandle, RawRecord};
use crate::value_objects::resolution::Resolution;
use crate::value_objects::series::SeriesKey;
use chrono::DateTime;

#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRecord {
    pub index: usize,
    pub error: SchemaError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedBatch {
    pub candles: Vec<Candle>,
    pub rejected: Vec<RejectedRecord>,
}

/// Maps one venue record onto the canonical schema for `key`. Misaligned timestamps
/// are rejected, never snapped to the nearest boundary.
pub fn normalize(record: &RawRecord, key: &SeriesKey) -> Result<Candle, SchemaError> {
    if record.exchange() != key.exchange {
        return Err(SchemaError::VenueMismatch {
            record: record.exchange(),
            expected: key.exchange,
        });
    }

    let candle = match record {
        RawRecord::Binance(kline) => normalize_binance(kline, key)?,
        RawRecord::Dydx(candle) => normalize_dydx(candle, key)?,
    };
    candle.check_invariants()?;
    Ok(candle)
}

pub fn normalize_batch(records: &[RawRecord], key: &SeriesKey) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    for (index, record) in records.iter().enumerate() {
        match normalize(record, key) {
            Ok(candle) => batch.candles.push(candle),
            Err(error) => batch.rejected.push(RejectedRecord { index, error }),
        }
    }
    batch
}

fn normalize_binance(kline: &BinanceKline, key: &SeriesKey) -> Result<Candle, SchemaError> {
    let open_time_ms = kline
        .open_time_ms
        .ok_or(SchemaError::MissingField("open_time"))?;
    let open_time = millis_to_seconds(open_time_ms, key.resolution)?;

    Ok(Candle {
        exchange: Exchange::BinanceFutures,
        symbol: key.symbol.clone(),
        resolution: key.resolution,
        open_time,
        open: parse_decimal(kline.open.as_deref(), "open")?,
        high: parse_decimal(kline.high.as_deref(), "high")?,
        low: parse_decimal(kline.low.as_deref(), "low")?,
        close: parse_decimal(kline.close.as_deref(), "close")?,
        volume: parse_decimal(kline.volume.as_deref(), "volume")?,
        source_seq: kline.trade_count,
    })
}

fn normalize_dydx(candle: &DydxCandle, key: &SeriesKey) -> Result<Candle, SchemaError> {
    if let Some(ticker) = candle.ticker.as_deref() {
        if !ticker.eq_ignore_ascii_case(&key.symbol) {
            return Err(SchemaError::InvalidValue {
                field: "ticker",
                value: ticker.to_string(),
            });
        }
    }
    if let Some(resolution) = candle.resolution.as_deref() {
        let parsed = Resolution::parse(resolution).map_err(|_| SchemaError::InvalidValue {
            field: "resolution",
            value: resolution.to_string(),
        })?;
        if parsed != key.resolution {
            return Err(SchemaError::InvalidValue {
                field: "resolution",
                value: resolution.to_string(),
            });
        }
    }

    let started_at = candle
        .started_at
        .as_deref()
        .ok_or(SchemaError::MissingField("startedAt"))?;
    let parsed = DateTime::parse_from_rfc3339(started_at).map_err(|_| SchemaError::InvalidValue {
        field: "startedAt",
        value: started_at.to_string(),
    })?;
    if parsed.timestamp_subsec_nanos() != 0 {
        return Err(SchemaError::Misaligned {
            open_time: parsed.timestamp(),
            resolution: key.resolution,
        });
    }

    Ok(Candle {
        exchange: Exchange::DydxV4,
        symbol: key.symbol.clone(),
        resolution: key.resolution,
        open_time: parsed.timestamp(),
        open: parse_decimal(candle.open.as_deref(), "open")?,
        high: parse_decimal(candle.high.as_deref(), "high")?,
        low: parse_decimal(candle.low.as_deref(), "low")?,
        close: parse_decimal(candle.close.as_deref(), "close")?,
        volume: parse_decimal(candle.base_token_volume.as_deref(), "baseTokenVolume")?,
        source_seq: candle.trades,
    })
}

fn millis_to_seconds(ms: i64, resolution: Resolution) -> Result<i64, SchemaError> {
    if ms.rem_euclid(1000) != 0 {
        return Err(SchemaError::Misaligned {
            open_time: ms.div_euclid(1000),
            resolution,
        });
    }
    Ok(ms / 1000)
}

fn parse_decimal(value: Option<&str>, field: &'static str) -> Result<f64, SchemaError> {
    let raw = value.ok_or(SchemaError::MissingField(field))?;
    let parsed = raw
        .trim()
        .parse::<f64>()
        .map_err(|_| SchemaError::InvalidValue {
            field,
            value: raw.to_string(),
        })?;
    if !parsed.is_finite() {
        return Err(SchemaError::InvalidValue {
            field,
            value: raw.to_string(),
        });
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binance_key() -> SeriesKey {
        SeriesKey::new(Exchange::BinanceFutures, "BTCUSDT", Resolution::M1)
    }

    fn dydx_key() -> SeriesKey {
        SeriesKey::new(Exchange::DydxV4, "BTC-USD", Resolution::M1)
    }

    fn kline(open_time_ms: i64) -> BinanceKline {
        BinanceKline {
            open_time_ms: Some(open_time_ms),
            open: Some("42000.10".to_string()),
            high: Some("42010.00".to_string()),
            low: Some("41990.50".to_string()),
            close: Some("42005.00".to_string()),
            volume: Some("12.345".to_string()),
            close_time_ms: Some(open_time_ms + 59_999),
            quote_volume: Some("518000.0".to_string()),
            trade_count: Some(321),
            taker_buy_base_volume: Some("6.0".to_string()),
            taker_buy_quote_volume: Some("252000.0".to_string()),
        }
    }

    fn dydx(started_at: &str) -> DydxCandle {
        DydxCandle {
            started_at: Some(started_at.to_string()),
            ticker: Some("BTC-USD".to_string()),
            resolution: Some("1MIN".to_string()),
            open: Some("64000".to_string()),
            high: Some("64050".to_string()),
            low: Some("63990".to_string()),
            close: Some("64020".to_string()),
            base_token_volume: Some("0.75".to_string()),
            usd_volume: Some("48015".to_string()),
            trades: Some(9),
        }
    }

    #[test]
    fn binance_kline_converts_millis_and_renames_fields() {
        let candle = normalize(&RawRecord::Binance(kline(1_700_000_040_000)), &binance_key())
            .expect("valid kline");
        assert_eq!(candle.open_time, 1_700_000_040);
        assert_eq!(candle.symbol, "BTCUSDT");
        assert!((candle.volume - 12.345).abs() < 1e-12);
        assert_eq!(candle.source_seq, Some(321));
    }

    #[test]
    fn misaligned_binance_timestamp_is_rejected() {
        let err = normalize(&RawRecord::Binance(kline(1_700_000_041_000)), &binance_key())
            .expect_err("off-boundary");
        assert!(matches!(err, SchemaError::Misaligned { .. }));

        let err = normalize(&RawRecord::Binance(kline(1_700_000_040_500)), &binance_key())
            .expect_err("sub-second");
        assert!(matches!(err, SchemaError::Misaligned { .. }));
    }

    #[test]
    fn dydx_candle_parses_rfc3339_and_base_volume() {
        let candle = normalize(
            &RawRecord::Dydx(dydx("2024-03-01T12:34:00.000Z")),
            &dydx_key(),
        )
        .expect("valid candle");
        assert_eq!(candle.open_time, 1_709_296_440);
        assert!((candle.volume - 0.75).abs() < 1e-12);
        assert_eq!(candle.source_seq, Some(9));
    }

    #[test]
    fn missing_and_out_of_range_fields_are_schema_errors() {
        let mut missing = kline(0);
        missing.close = None;
        assert_eq!(
            normalize(&RawRecord::Binance(missing), &binance_key()),
            Err(SchemaError::MissingField("close"))
        );

        let mut negative = kline(0);
        negative.volume = Some("-1".to_string());
        assert!(matches!(
            normalize(&RawRecord::Binance(negative), &binance_key()),
            Err(SchemaError::OutOfRange(_))
        ));

        let mut inverted = dydx("2024-03-01T12:34:00Z");
        inverted.high = Some("63000".to_string());
        assert!(matches!(
            normalize(&RawRecord::Dydx(inverted), &dydx_key()),
            Err(SchemaError::OutOfRange(_))
        ));
    }

    #[test]
    fn venue_payloads_do_not_cross_exchanges() {
        let err = normalize(&RawRecord::Dydx(dydx("2024-03-01T12:34:00Z")), &binance_key())
            .expect_err("wrong venue");
        assert!(matches!(err, SchemaError::VenueMismatch { .. }));
    }

    #[test]
    fn batch_isolates_bad_records() {
        let mut bad = kline(60_000);
        bad.open = Some("abc".to_string());
        let records = vec![
            RawRecord::Binance(kline(0)),
            RawRecord::Binance(bad),
            RawRecord::Binance(kline(120_000)),
        ];
        let batch = normalize_batch(&records, &binance_key());
        assert_eq!(batch.candles.len(), 2);
        assert_eq!(batch.rejected.len(), 1);
        assert_eq!(batch.rejected[0].index, 1);
    }
}
