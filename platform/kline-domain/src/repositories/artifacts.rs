use crate::value_objects::quality_report::QualityReport;
use std::path::{Path, PathBuf};

pub trait ReportWriter: Send + Sync {
    fn ensure_dir(&self, path: &Path) -> Result<(), String>;
    /// Replaces the report file wholesale; readers never see a half-written report.
    fn write_quality_report(&self, dir: &Path, report: &QualityReport) -> Result<PathBuf, String>;
    fn write_run_summary(&self, path: &Path, summary: &serde_json::Value) -> Result<(), String>;
}
