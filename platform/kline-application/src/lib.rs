pub mod config;
pub mod ingestion;
pub mod quality;
pub mod query;
pub mod rate_limiter;
pub mod scheduler;
pub mod validation;
