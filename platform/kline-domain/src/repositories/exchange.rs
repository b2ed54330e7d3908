use crate::errors::FetchError;
use crate::value_objects::exchange::Exchange;
use crate::value_objects::market_snapshot::{Capability, FundingRate, OrderbookDepth};
use crate::value_objects::raw_record::RawRecord;
use crate::value_objects::resolution::Resolution;
use async_trait::async_trait;

/// One venue's wire protocol. Implementations return records ascending by open
/// time and never retry on their own.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn exchange(&self) -> Exchange;

    fn capabilities(&self) -> &[Capability];

    fn max_candles_per_request(&self) -> usize;

    /// `start_time` and `end_time` are inclusive bucket open times in epoch seconds.
    async fn fetch_candles(
        &self,
        symbol: &str,
        resolution: Resolution,
        start_time: i64,
        end_time: i64,
    ) -> Result<Vec<RawRecord>, FetchError>;

    async fn fetch_orderbook_depth(&self, symbol: &str) -> Result<OrderbookDepth, FetchError> {
        Err(FetchError::Unsupported(format!(
            "{} does not serve orderbook depth for {symbol}",
            self.exchange()
        )))
    }

    async fn fetch_funding_rate(&self, symbol: &str) -> Result<FundingRate, FetchError> {
        Err(FetchError::Unsupported(format!(
            "{} does not serve funding rates for {symbol}",
            self.exchange()
        )))
    }

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }
}
