pub mod binance;
pub mod dydx;
pub mod http;

pub use binance::BinanceFuturesAdapter;
pub use dydx::DydxAdapter;
