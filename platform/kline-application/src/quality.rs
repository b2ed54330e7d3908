use kline_domain::value_objects::quality_report::QualityReport;
use kline_domain::value_objects::series::SeriesKey;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Latest report per key. Reports are published whole; a reader holding an `Arc`
/// keeps its snapshot even while a newer one is swapped in.
#[derive(Debug, Default)]
pub struct QualityRegistry {
    reports: RwLock<HashMap<SeriesKey, Arc<QualityReport>>>,
}

impl QualityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, report: QualityReport) -> Arc<QualityReport> {
        let report = Arc::new(report);
        self.reports
            .write()
            .insert(report.key.clone(), report.clone());
        report
    }

    pub fn get(&self, key: &SeriesKey) -> Option<Arc<QualityReport>> {
        self.reports.read().get(key).cloned()
    }

    pub fn all(&self) -> Vec<Arc<QualityReport>> {
        let mut reports: Vec<Arc<QualityReport>> = self.reports.read().values().cloned().collect();
        reports.sort_by(|a, b| a.key.cmp(&b.key));
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kline_domain::value_objects::exchange::Exchange;
    use kline_domain::value_objects::quality_report::Severity;
    use kline_domain::value_objects::resolution::Resolution;

    #[test]
    fn publish_swaps_whole_reports() {
        let registry = QualityRegistry::new();
        let key = SeriesKey::new(Exchange::BinanceFutures, "BTCUSDT", Resolution::M1);

        let first = registry.publish(QualityReport::empty(key.clone()));
        let held = registry.get(&key).expect("published");

        let mut degraded = QualityReport::empty(key.clone());
        degraded.severity = Severity::Degraded;
        registry.publish(degraded);

        assert_eq!(held.severity, Severity::Ok);
        assert!(Arc::ptr_eq(&first, &held));
        assert_eq!(registry.get(&key).unwrap().severity, Severity::Degraded);
        assert_eq!(registry.all().len(), 1);
    }
}
