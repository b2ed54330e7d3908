use crate::value_objects::series::SeriesKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inclusive range of missing bucket open times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapRange {
    pub start: i64,
    pub end: i64,
}

impl GapRange {
    pub fn missing_buckets(&self, step_seconds: i64) -> i64 {
        (self.end - self.start) / step_seconds.max(1) + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderingViolation {
    pub index: usize,
    pub previous_open_time: i64,
    pub open_time: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutlierKind {
    ZeroVolume,
    NegativeVolume,
    OhlcViolation,
    NonFinite,
    Misaligned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlierFlag {
    pub open_time: i64,
    pub kind: OutlierKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Ok,
    Degraded,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub key: SeriesKey,
    pub rows: usize,
    pub first_open_time: Option<i64>,
    pub last_open_time: Option<i64>,
    pub gaps: Vec<GapRange>,
    pub missing_buckets: i64,
    pub duplicates: Vec<i64>,
    pub ordering_violations: Vec<OrderingViolation>,
    pub outliers: Vec<OutlierFlag>,
    pub partial_buckets: Vec<i64>,
    pub severity: Severity,
    pub generated_at: Option<DateTime<Utc>>,
}

impl QualityReport {
    pub fn empty(key: SeriesKey) -> Self {
        Self {
            key,
            rows: 0,
            first_open_time: None,
            last_open_time: None,
            gaps: Vec::new(),
            missing_buckets: 0,
            duplicates: Vec::new(),
            ordering_violations: Vec::new(),
            outliers: Vec::new(),
            partial_buckets: Vec::new(),
            severity: Severity::Ok,
            generated_at: None,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }

    pub fn stamped(mut self, at: DateTime<Utc>) -> Self {
        self.generated_at = Some(at);
        self
    }

    pub fn breaches(&self, limits: &QualityLimits) -> Vec<String> {
        let mut breaches = Vec::new();
        let mut check = |name: &str, actual: usize, limit: Option<usize>| {
            let limit = limit.unwrap_or(0);
            if actual > limit {
                breaches.push(format!("{name}: {actual} > {limit}"));
            }
        };
        check("gaps", self.gaps.len(), limits.max_gaps);
        check(
            "missing_buckets",
            self.missing_buckets.max(0) as usize,
            limits.max_missing_buckets,
        );
        check("duplicates", self.duplicates.len(), limits.max_duplicates);
        check("outliers", self.outliers.len(), limits.max_outliers);
        check("partial_buckets", self.partial_buckets.len(), limits.max_partial);
        if self.is_fatal() {
            breaches.push(format!(
                "ordering_violations: {}",
                self.ordering_violations.len()
            ));
        }
        breaches
    }
}

/// Strict-mode tolerances. An unset limit tolerates nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityLimits {
    pub max_gaps: Option<usize>,
    pub max_missing_buckets: Option<usize>,
    pub max_duplicates: Option<usize>,
    pub max_outliers: Option<usize>,
    pub max_partial: Option<usize>,
}
