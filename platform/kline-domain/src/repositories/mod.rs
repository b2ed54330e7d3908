pub mod artifacts;
pub mod candle_store;
pub mod dead_letter;
pub mod derived_store;
pub mod exchange;
