use super::http::{build_client, opt_string, opt_u64, send_json, HttpSettings};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use kline_domain::errors::FetchError;
use kline_domain::repositories::exchange::ExchangeAdapter;
use kline_domain::value_objects::exchange::Exchange;
use kline_domain::value_objects::market_snapshot::{
    Capability, DepthLevel, FundingRate, OrderbookDepth,
};
use kline_domain::value_objects::raw_record::{DydxCandle, RawRecord};
use kline_domain::value_objects::resolution::Resolution;
use reqwest::Client;
use serde::Deserialize;

pub const DYDX_MAX_LIMIT: usize = 1000;

const CAPABILITIES: [Capability; 3] = [
    Capability::Candles,
    Capability::OrderbookDepth,
    Capability::FundingRate,
];

/// dYdX v4 indexer (public, unauthenticated).
pub struct DydxAdapter {
    settings: HttpSettings,
    client: Client,
}

impl DydxAdapter {
    pub fn new(settings: HttpSettings) -> Result<Self, String> {
        let client = build_client(&settings)?;
        Ok(Self { settings, client })
    }
}

pub fn resolution_param(resolution: Resolution) -> Option<&'static str> {
    match resolution {
        Resolution::M1 => Some("1MIN"),
        Resolution::M5 => Some("5MINS"),
        Resolution::M15 => Some("15MINS"),
        Resolution::M30 => Some("30MINS"),
        Resolution::H1 => Some("1HOUR"),
        Resolution::H4 => Some("4HOURS"),
        Resolution::D1 => Some("1DAY"),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct CandlesResponse {
    #[serde(default)]
    candles: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OrderbookResponse {
    #[serde(default)]
    bids: Vec<WireLevel>,
    #[serde(default)]
    asks: Vec<WireLevel>,
}

#[derive(Debug, Deserialize)]
struct WireLevel {
    price: String,
    size: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FundingResponse {
    #[serde(default)]
    historical_funding: Vec<WireFunding>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireFunding {
    rate: String,
    effective_at: String,
}

fn iso(ts: i64) -> Result<String, FetchError> {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .ok_or_else(|| FetchError::Protocol(format!("timestamp out of range: {ts}")))
}

/// Maps indexer candle objects onto raw records, oldest first. The indexer pages
/// newest-first.
pub fn parse_candles(items: &[serde_json::Value]) -> Vec<RawRecord> {
    let mut candles: Vec<DydxCandle> = items
        .iter()
        .map(|item| DydxCandle {
            started_at: opt_string(item.get("startedAt")),
            ticker: opt_string(item.get("ticker")),
            resolution: opt_string(item.get("resolution")),
            open: opt_string(item.get("open")),
            high: opt_string(item.get("high")),
            low: opt_string(item.get("low")),
            close: opt_string(item.get("close")),
            base_token_volume: opt_string(item.get("baseTokenVolume")),
            usd_volume: opt_string(item.get("usdVolume")),
            trades: opt_u64(item.get("trades")),
        })
        .collect();
    candles.reverse();
    candles.sort_by_key(|candle| {
        candle
            .started_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.timestamp())
            .unwrap_or(i64::MIN)
    });
    candles.into_iter().map(RawRecord::Dydx).collect()
}

fn parse_level(level: &WireLevel) -> Result<DepthLevel, FetchError> {
    let price = level
        .price
        .parse::<f64>()
        .map_err(|err| FetchError::Protocol(format!("invalid depth price {}: {err}", level.price)))?;
    let size = level
        .size
        .parse::<f64>()
        .map_err(|err| FetchError::Protocol(format!("invalid depth size {}: {err}", level.size)))?;
    Ok(DepthLevel { price, size })
}

#[async_trait]
impl ExchangeAdapter for DydxAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::DydxV4
    }

    fn capabilities(&self) -> &[Capability] {
        &CAPABILITIES
    }

    fn max_candles_per_request(&self) -> usize {
        DYDX_MAX_LIMIT
    }

    async fn fetch_candles(
        &self,
        symbol: &str,
        resolution: Resolution,
        start_time: i64,
        end_time: i64,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let param = resolution_param(resolution).ok_or_else(|| {
            FetchError::Unsupported(format!("dydx indexer has no {resolution} resolution"))
        })?;
        let buckets = ((end_time - start_time) / resolution.seconds() + 1).max(1) as usize;
        let limit = buckets.min(DYDX_MAX_LIMIT);
        let path = format!("/v4/candles/perpetualMarkets/{symbol}");
        let request = self.client.get(self.settings.endpoint(&path)).query(&[
            ("resolution", param.to_string()),
            ("fromISO", iso(start_time)?),
            ("toISO", iso(end_time)?),
            ("limit", limit.to_string()),
        ]);
        let response: CandlesResponse = send_json("dydx_v4", request).await?;
        Ok(parse_candles(&response.candles))
    }

    async fn fetch_orderbook_depth(&self, symbol: &str) -> Result<OrderbookDepth, FetchError> {
        let path = format!("/v4/orderbooks/perpetualMarket/{symbol}");
        let request = self.client.get(self.settings.endpoint(&path));
        let response: OrderbookResponse = send_json("dydx_v4", request).await?;
        Ok(OrderbookDepth {
            symbol: symbol.to_string(),
            bids: response
                .bids
                .iter()
                .map(parse_level)
                .collect::<Result<_, _>>()?,
            asks: response
                .asks
                .iter()
                .map(parse_level)
                .collect::<Result<_, _>>()?,
            fetched_at: Utc::now(),
        })
    }

    async fn fetch_funding_rate(&self, symbol: &str) -> Result<FundingRate, FetchError> {
        let path = format!("/v4/historicalFunding/{symbol}");
        let request = self
            .client
            .get(self.settings.endpoint(&path))
            .query(&[("limit", "1")]);
        let response: FundingResponse = send_json("dydx_v4", request).await?;
        let latest = response
            .historical_funding
            .first()
            .ok_or_else(|| FetchError::Protocol(format!("no funding history for {symbol}")))?;
        let rate = latest
            .rate
            .parse::<f64>()
            .map_err(|err| FetchError::Protocol(format!("invalid funding rate: {err}")))?;
        let effective_at = DateTime::parse_from_rfc3339(&latest.effective_at)
            .map_err(|err| FetchError::Protocol(format!("invalid effectiveAt: {err}")))?
            .with_timezone(&Utc);
        Ok(FundingRate {
            symbol: symbol.to_string(),
            rate,
            effective_at,
        })
    }
}
