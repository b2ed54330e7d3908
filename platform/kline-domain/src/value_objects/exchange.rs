use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exchange {
    BinanceFutures,
    DydxV4,
}

impl Exchange {
    pub const ALL: [Exchange; 2] = [Exchange::BinanceFutures, Exchange::DydxV4];

    pub fn id(&self) -> &'static str {
        match self {
            Exchange::BinanceFutures => "binance_futures",
            Exchange::DydxV4 => "dydx_v4",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        let normalized = value.trim().to_lowercase().replace('-', "_");
        match normalized.as_str() {
            "binance" | "binance_futures" | "binance_usdm" => Ok(Exchange::BinanceFutures),
            "dydx" | "dydx_v4" => Ok(Exchange::DydxV4),
            _ => Err(format!("unsupported exchange: {value}")),
        }
    }

    /// Zero-volume bars are expected on thin dYdX markets but not on Binance perpetuals.
    pub fn zero_volume_implausible(&self) -> bool {
        matches!(self, Exchange::BinanceFutures)
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Exchange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
