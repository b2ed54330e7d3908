pub mod candle;
pub mod exchange;
pub mod fetch_window;
pub mod market_snapshot;
pub mod quality_report;
pub mod raw_record;
pub mod resolution;
pub mod series;
