use crate::value_objects::exchange::Exchange;
use serde::{Deserialize, Serialize};

/// Venue payload exactly as the adapter decoded it. Fields are optional so that a
/// malformed row reaches the normalizer (and is rejected there) instead of failing
/// the whole response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "venue", rename_all = "snake_case")]
pub enum RawRecord {
    Binance(BinanceKline),
    Dydx(DydxCandle),
}

impl RawRecord {
    pub fn exchange(&self) -> Exchange {
        match self {
            RawRecord::Binance(_) => Exchange::BinanceFutures,
            RawRecord::Dydx(_) => Exchange::DydxV4,
        }
    }
}

/// One row of `GET /fapi/v1/klines`. Prices and volumes arrive as decimal strings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BinanceKline {
    pub open_time_ms: Option<i64>,
    pub open: Option<String>,
    pub high: Option<String>,
    pub low: Option<String>,
    pub close: Option<String>,
    pub volume: Option<String>,
    pub close_time_ms: Option<i64>,
    pub quote_volume: Option<String>,
    pub trade_count: Option<u64>,
    pub taker_buy_base_volume: Option<String>,
    pub taker_buy_quote_volume: Option<String>,
}

/// One element of the dYdX v4 indexer `candles` array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DydxCandle {
    pub started_at: Option<String>,
    pub ticker: Option<String>,
    pub resolution: Option<String>,
    pub open: Option<String>,
    pub high: Option<String>,
    pub low: Option<String>,
    pub close: Option<String>,
    pub base_token_volume: Option<String>,
    pub usd_volume: Option<String>,
    pub trades: Option<u64>,
}
