use crate::value_objects::candle::{Candle, DerivedCandle};
use crate::value_objects::exchange::Exchange;
use crate::value_objects::quality_report::{
    GapRange, OrderingViolation, OutlierFlag, OutlierKind, QualityReport, Severity,
};
use crate::value_objects::series::{SeriesKey, TimeSeries};
use std::collections::BTreeSet;

/// Per-venue knobs for outlier detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VenueProfile {
    pub zero_volume_implausible: bool,
}

impl VenueProfile {
    pub fn for_exchange(exchange: Exchange) -> Self {
        Self {
            zero_volume_implausible: exchange.zero_volume_implausible(),
        }
    }
}

/// Audits a series without touching it. `generated_at` is left empty so the
/// same input always yields the same report; callers stamp it when publishing.
pub fn validate_series(series: &TimeSeries, profile: &VenueProfile) -> QualityReport {
    let mut report = QualityReport::empty(series.key.clone());
    scan(&mut report, &series.key, series.candles.iter(), profile);
    report.severity = severity_of(&report);
    report
}

pub fn validate_derived(
    key: &SeriesKey,
    candles: &[DerivedCandle],
    profile: &VenueProfile,
) -> QualityReport {
    let mut report = QualityReport::empty(key.clone());
    scan(&mut report, key, candles.iter().map(|d| &d.candle), profile);
    report.partial_buckets = candles
        .iter()
        .filter(|d| !d.is_complete())
        .map(|d| d.open_time())
        .collect();
    report.severity = severity_of(&report);
    report
}

fn scan<'a>(
    report: &mut QualityReport,
    key: &SeriesKey,
    candles: impl Iterator<Item = &'a Candle>,
    profile: &VenueProfile,
) {
    let step = key.resolution.seconds();
    let mut seen = BTreeSet::new();
    let mut duplicates = BTreeSet::new();
    let mut previous: Option<i64> = None;

    for (index, candle) in candles.enumerate() {
        let ts = candle.open_time;
        report.rows += 1;
        if report.first_open_time.is_none() {
            report.first_open_time = Some(ts);
        }
        report.last_open_time = Some(ts);

        if !seen.insert(ts) {
            duplicates.insert(ts);
        }

        if let Some(prev) = previous {
            if ts <= prev {
                report.ordering_violations.push(OrderingViolation {
                    index,
                    previous_open_time: prev,
                    open_time: ts,
                });
            } else if ts - prev > step {
                let gap = GapRange {
                    start: prev + step,
                    end: ts - step,
                };
                // misaligned neighbours can produce an empty range; those are flagged as outliers
                if gap.end >= gap.start {
                    report.missing_buckets += gap.missing_buckets(step);
                    report.gaps.push(gap);
                }
            }
        }
        previous = Some(ts);

        if let Some(kind) = outlier_kind(candle, key, profile) {
            report.outliers.push(OutlierFlag { open_time: ts, kind });
        }
    }

    report.duplicates = duplicates.into_iter().collect();
}

fn outlier_kind(candle: &Candle, key: &SeriesKey, profile: &VenueProfile) -> Option<OutlierKind> {
    let values = [candle.open, candle.high, candle.low, candle.close, candle.volume];
    if values.iter().any(|v| !v.is_finite()) {
        return Some(OutlierKind::NonFinite);
    }
    if !key.resolution.is_aligned(candle.open_time) {
        return Some(OutlierKind::Misaligned);
    }
    if candle.volume < 0.0 {
        return Some(OutlierKind::NegativeVolume);
    }
    if candle.high < candle.low
        || candle.high < candle.open.max(candle.close)
        || candle.low > candle.open.min(candle.close)
    {
        return Some(OutlierKind::OhlcViolation);
    }
    if profile.zero_volume_implausible && candle.volume == 0.0 {
        return Some(OutlierKind::ZeroVolume);
    }
    None
}

fn severity_of(report: &QualityReport) -> Severity {
    if !report.ordering_violations.is_empty() {
        Severity::Fatal
    } else if report.gaps.is_empty()
        && report.duplicates.is_empty()
        && report.outliers.is_empty()
        && report.partial_buckets.is_empty()
    {
        Severity::Ok
    } else {
        Severity::Degraded
    }
}
