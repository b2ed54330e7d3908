use super::http::{build_client, opt_i64, opt_string, opt_u64, send_json, HttpSettings};
use async_trait::async_trait;
use kline_domain::errors::FetchError;
use kline_domain::repositories::exchange::ExchangeAdapter;
use kline_domain::value_objects::exchange::Exchange;
use kline_domain::value_objects::market_snapshot::Capability;
use kline_domain::value_objects::raw_record::{BinanceKline, RawRecord};
use kline_domain::value_objects::resolution::Resolution;
use reqwest::Client;

pub const BINANCE_MAX_LIMIT: usize = 1500;
const KLINES_PATH: &str = "/fapi/v1/klines";

/// USDⓈ-M futures klines. Only candles are served; depth and funding stay unsupported.
pub struct BinanceFuturesAdapter {
    settings: HttpSettings,
    client: Client,
}

impl BinanceFuturesAdapter {
    pub fn new(settings: HttpSettings) -> Result<Self, String> {
        let client = build_client(&settings)?;
        Ok(Self { settings, client })
    }
}

/// Binance has no 8m or 10m interval; those must be derived locally.
pub fn interval_for(resolution: Resolution) -> Option<&'static str> {
    let interval = match resolution {
        Resolution::M1 => "1m",
        Resolution::M3 => "3m",
        Resolution::M5 => "5m",
        Resolution::M15 => "15m",
        Resolution::M30 => "30m",
        Resolution::H1 => "1h",
        Resolution::H2 => "2h",
        Resolution::H4 => "4h",
        Resolution::H6 => "6h",
        Resolution::H12 => "12h",
        Resolution::D1 => "1d",
        Resolution::D3 => "3d",
        Resolution::W1 => "1w",
        Resolution::M8 | Resolution::M10 => return None,
    };
    Some(interval)
}

/// Decodes the positional kline arrays. Rows that are not arrays become empty
/// records so the normalizer rejects them one by one.
pub fn parse_kline_rows(rows: &[serde_json::Value]) -> Vec<RawRecord> {
    rows.iter()
        .map(|row| {
            let kline = match row.as_array() {
                Some(cols) => BinanceKline {
                    open_time_ms: opt_i64(cols.first()),
                    open: opt_string(cols.get(1)),
                    high: opt_string(cols.get(2)),
                    low: opt_string(cols.get(3)),
                    close: opt_string(cols.get(4)),
                    volume: opt_string(cols.get(5)),
                    close_time_ms: opt_i64(cols.get(6)),
                    quote_volume: opt_string(cols.get(7)),
                    trade_count: opt_u64(cols.get(8)),
                    taker_buy_base_volume: opt_string(cols.get(9)),
                    taker_buy_quote_volume: opt_string(cols.get(10)),
                },
                None => BinanceKline::default(),
            };
            RawRecord::Binance(kline)
        })
        .collect()
}

#[async_trait]
impl ExchangeAdapter for BinanceFuturesAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::BinanceFutures
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Candles]
    }

    fn max_candles_per_request(&self) -> usize {
        BINANCE_MAX_LIMIT
    }

    async fn fetch_candles(
        &self,
        symbol: &str,
        resolution: Resolution,
        start_time: i64,
        end_time: i64,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let interval = interval_for(resolution).ok_or_else(|| {
            FetchError::Unsupported(format!("binance futures has no {resolution} interval"))
        })?;
        let buckets = ((end_time - start_time) / resolution.seconds() + 1).max(1) as usize;
        let limit = buckets.min(BINANCE_MAX_LIMIT);

        let request = self.client.get(self.settings.endpoint(KLINES_PATH)).query(&[
            ("symbol", symbol.to_string()),
            ("interval", interval.to_string()),
            ("startTime", (start_time * 1000).to_string()),
            ("endTime", (end_time * 1000).to_string()),
            ("limit", limit.to_string()),
        ]);
        let rows: Vec<serde_json::Value> = send_json("binance_futures", request).await?;
        let mut records = parse_kline_rows(&rows);
        records.sort_by_key(|record| match record {
            RawRecord::Binance(kline) => kline.open_time_ms.unwrap_or(i64::MIN),
            RawRecord::Dydx(_) => i64::MIN,
        });
        Ok(records)
    }
}
