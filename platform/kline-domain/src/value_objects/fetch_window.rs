use crate::errors::FetchError;
use crate::value_objects::series::SeriesKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowStatus {
    Pending,
    InFlight,
    Done,
    Failed,
}

/// Request unit tracked by the scheduler. `start_time` and `end_time` are inclusive
/// bucket open times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchWindow {
    pub id: u64,
    pub key: SeriesKey,
    pub start_time: i64,
    pub end_time: i64,
    pub retries: u32,
    pub status: WindowStatus,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub not_before: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt that follows failure number `failures` (1-based).
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Done,
    Rescheduled {
        not_before: Instant,
        consumed_retry: bool,
    },
    DeadLettered,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: WindowStatus,
    pub action: &'static str,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot {} a window in state {:?}", self.action, self.from)
    }
}

impl std::error::Error for InvalidTransition {}

impl FetchWindow {
    pub fn new(id: u64, key: SeriesKey, start_time: i64, end_time: i64) -> Self {
        Self {
            id,
            key,
            start_time,
            end_time,
            retries: 0,
            status: WindowStatus::Pending,
            last_error: None,
            not_before: None,
        }
    }

    pub fn is_eligible(&self, now: Instant) -> bool {
        self.status == WindowStatus::Pending && self.not_before.map_or(true, |at| at <= now)
    }

    pub fn expected_buckets(&self) -> i64 {
        (self.end_time - self.start_time) / self.key.resolution.seconds() + 1
    }

    pub fn begin_attempt(&mut self) -> Result<(), InvalidTransition> {
        self.expect(WindowStatus::Pending, "start")?;
        self.status = WindowStatus::InFlight;
        Ok(())
    }

    pub fn complete(&mut self) -> Result<Transition, InvalidTransition> {
        self.expect(WindowStatus::InFlight, "complete")?;
        self.status = WindowStatus::Done;
        self.not_before = None;
        Ok(Transition::Done)
    }

    /// Applies a failed attempt. Rate limits are honoured exactly and never count
    /// against the retry budget; every other failure counts, and the window is
    /// dead-lettered once more than `max_retries` failures have been recorded.
    pub fn fail(
        &mut self,
        error: &FetchError,
        now: Instant,
        policy: &RetryPolicy,
    ) -> Result<Transition, InvalidTransition> {
        self.expect(WindowStatus::InFlight, "fail")?;
        self.last_error = Some(error.to_string());

        if let FetchError::RateLimited { retry_after } = error {
            let not_before = now + *retry_after;
            self.status = WindowStatus::Pending;
            self.not_before = Some(not_before);
            return Ok(Transition::Rescheduled {
                not_before,
                consumed_retry: false,
            });
        }

        self.retries = self.retries.saturating_add(1);
        if !error.is_retryable() || self.retries > policy.max_retries {
            self.status = WindowStatus::Failed;
            self.not_before = None;
            return Ok(Transition::DeadLettered);
        }

        let not_before = now + policy.backoff(self.retries);
        self.status = WindowStatus::Pending;
        self.not_before = Some(not_before);
        Ok(Transition::Rescheduled {
            not_before,
            consumed_retry: true,
        })
    }

    /// Cancellation path: the attempt is forgotten and the window goes back to the queue.
    pub fn abandon(&mut self) -> Result<(), InvalidTransition> {
        self.expect(WindowStatus::InFlight, "abandon")?;
        self.status = WindowStatus::Pending;
        Ok(())
    }

    /// Fresh copy for operator replay: retry budget and backoff are reset.
    pub fn revived(&self, id: u64) -> Self {
        Self::new(id, self.key.clone(), self.start_time, self.end_time)
    }

    fn expect(&self, status: WindowStatus, action: &'static str) -> Result<(), InvalidTransition> {
        if self.status == status {
            Ok(())
        } else {
            Err(InvalidTransition {
                from: self.status,
                action,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub window: FetchWindow,
    pub reason: String,
    pub error_kind: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Window ids restart every run, so a letter is identified by its range and failure time.
    pub fn same_letter(&self, other: &DeadLetter) -> bool {
        self.window.key == other.window.key
            && self.window.start_time == other.window.start_time
            && self.window.end_time == other.window.end_time
            && self.failed_at == other.failed_at
    }
}
