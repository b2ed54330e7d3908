use kline_domain::value_objects::quality_report::{QualityLimits, QualityReport, Severity};
use std::sync::Arc;
use tracing::info_span;

/// Summarises a batch of reports against the configured limits. In strict mode any
/// breach, or any fatal report, is an error.
pub fn evaluate_reports(
    reports: &[Arc<QualityReport>],
    limits: &QualityLimits,
    strict: bool,
) -> Result<serde_json::Value, String> {
    let _span = info_span!("evaluate_reports", strict, reports = reports.len()).entered();

    let mut failing = Vec::new();
    let mut rows = Vec::with_capacity(reports.len());
    for report in reports {
        let breaches = report.breaches(limits);
        if !breaches.is_empty() {
            failing.push(report.key.to_string());
        }
        metrics::gauge!("kline.validate.partial_buckets", "key" => report.key.to_string())
            .set(report.partial_buckets.len() as f64);
        rows.push(serde_json::json!({
            "key": report.key.to_string(),
            "severity": report.severity,
            "rows": report.rows,
            "first_open_time": report.first_open_time,
            "last_open_time": report.last_open_time,
            "gaps": report.gaps.len(),
            "missing_buckets": report.missing_buckets,
            "duplicates": report.duplicates.len(),
            "ordering_violations": report.ordering_violations.len(),
            "outliers": report.outliers.len(),
            "partial_buckets": report.partial_buckets.len(),
            "breaches": breaches,
        }));
    }

    let fatal = reports.iter().filter(|r| r.severity == Severity::Fatal).count();
    if strict && (!failing.is_empty() || fatal > 0) {
        return Err(format!(
            "strict validation failed: data quality limits exceeded for {}",
            failing.join(", ")
        ));
    }

    Ok(serde_json::json!({
        "series": rows,
        "fatal": fatal,
        "failing": failing,
        "limits": {
            "max_gaps": limits.max_gaps.unwrap_or(0),
            "max_missing_buckets": limits.max_missing_buckets.unwrap_or(0),
            "max_duplicates": limits.max_duplicates.unwrap_or(0),
            "max_outliers": limits.max_outliers.unwrap_or(0),
            "max_partial": limits.max_partial.unwrap_or(0),
        },
        "strict": strict,
    }))
}
