use crate::value_objects::candle::Candle;
use crate::value_objects::exchange::Exchange;
use crate::value_objects::resolution::Resolution;
use crate::value_objects::series::SeriesKey;
use std::time::Duration;
use thiserror::Error;

/// Failures an exchange adapter reports for a single request. Adapters never retry;
/// the scheduler decides what happens next.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
    #[error("network error: {0}")]
    Network(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("auth error: {0}")]
    Auth(String),
    #[error("unsupported capability: {0}")]
    Unsupported(String),
}

impl FetchError {
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::RateLimited { .. } => "rate_limited",
            FetchError::Network(_) => "network",
            FetchError::Protocol(_) => "protocol",
            FetchError::Auth(_) => "auth",
            FetchError::Unsupported(_) => "unsupported",
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchError::Unsupported(_))
    }
}

/// A single raw record could not be turned into a canonical candle.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("invalid value for `{field}`: {value}")]
    InvalidValue { field: &'static str, value: String },
    #[error("open time {open_time} is not aligned to {resolution}")]
    Misaligned {
        open_time: i64,
        resolution: Resolution,
    },
    #[error("value out of range: {0}")]
    OutOfRange(String),
    #[error("{record} record cannot be normalized for {expected}")]
    VenueMismatch {
        record: Exchange,
        expected: Exchange,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("conflicting candle for {key} at {open_time}: stored close={} incoming close={}", .existing.close, .incoming.close)]
    Conflict {
        key: SeriesKey,
        open_time: i64,
        existing: Box<Candle>,
        incoming: Box<Candle>,
    },
    #[error("no active candle for {key} at {open_time}")]
    NotFound { key: SeriesKey, open_time: i64 },
    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResampleError {
    #[error("cannot resample {source_resolution} into {target}: target is not a whole multiple")]
    IncompatibleResolution {
        source_resolution: Resolution,
        target: Resolution,
    },
    #[error("input for {key} is not strictly increasing at index {index}")]
    UnorderedInput { key: SeriesKey, index: usize },
    #[error("input candle at {open_time} does not belong to {key}")]
    ForeignCandle { key: SeriesKey, open_time: i64 },
}
