pub mod artifacts;
pub mod exchanges;
pub mod persistence;
