use kline_domain::repositories::artifacts::ReportWriter;
use kline_domain::value_objects::quality_report::QualityReport;
use kline_domain::value_objects::series::SeriesKey;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Default, Clone, Copy)]
pub struct FilesystemReportWriter;

impl FilesystemReportWriter {
    pub fn new() -> Self {
        Self
    }
}

/// Symbol bytes outside `[A-Za-z0-9_-]` are written as `%XX`, so distinct
/// symbols never share a file.
pub fn report_file_name(key: &SeriesKey) -> String {
    let mut symbol = String::with_capacity(key.symbol.len());
    for byte in key.symbol.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            symbol.push(char::from(byte));
        } else {
            symbol.push_str(&format!("%{byte:02X}"));
        }
    }
    format!("quality_{}_{}_{}.json", key.exchange.id(), symbol, key.resolution)
}

/// Writes to a hidden sibling first and renames over the target, so a reader sees
/// either the previous file or the new one.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), String> {
    let file_name = path
        .file_name()
        .ok_or_else(|| format!("artifact path has no file name: {}", path.display()))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));
    fs::write(&tmp, contents)
        .map_err(|err| format!("failed to write {}: {}", tmp.display(), err))?;
    fs::rename(&tmp, path)
        .map_err(|err| format!("failed to replace {}: {}", path.display(), err))
}

impl ReportWriter for FilesystemReportWriter {
    fn ensure_dir(&self, path: &Path) -> Result<(), String> {
        fs::create_dir_all(path)
            .map_err(|err| format!("failed to create dir {}: {}", path.display(), err))
    }

    fn write_quality_report(&self, dir: &Path, report: &QualityReport) -> Result<PathBuf, String> {
        self.ensure_dir(dir)?;
        let path = dir.join(report_file_name(&report.key));
        let json = serde_json::to_vec_pretty(report)
            .map_err(|err| format!("failed to serialize quality report: {err}"))?;
        write_atomic(&path, &json)?;
        tracing::debug!(path = %path.display(), severity = ?report.severity, "quality report written");
        Ok(path)
    }

    fn write_run_summary(&self, path: &Path, summary: &serde_json::Value) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                self.ensure_dir(parent)?;
            }
        }
        let json = serde_json::to_vec_pretty(summary)
            .map_err(|err| format!("failed to serialize run summary: {err}"))?;
        write_atomic(path, &json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kline_domain::value_objects::exchange::Exchange;
    use kline_domain::value_objects::resolution::Resolution;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("kline-artifacts-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn file_name_is_stable_and_path_safe() {
        let key = SeriesKey::new(Exchange::BinanceFutures, "BTC/USDT", Resolution::M5);
        assert_eq!(report_file_name(&key), "quality_binance_futures_BTC%2FUSDT_5m.json");
        let key = SeriesKey::new(Exchange::DydxV4, "BTC-USD", Resolution::M1);
        assert_eq!(report_file_name(&key), "quality_dydx_v4_BTC-USD_1m.json");
    }

    #[test]
    fn similar_symbols_get_distinct_files() {
        let names: std::collections::BTreeSet<String> = ["BTC/USD", "BTC_USD", "BTC%2FUSD", "BTC USD"]
            .into_iter()
            .map(|symbol| {
                report_file_name(&SeriesKey::new(Exchange::BinanceFutures, symbol, Resolution::M5))
            })
            .collect();
        assert_eq!(names.len(), 4);
    }

    #[test]
    fn report_is_replaced_wholesale() {
        let dir = temp_dir("replace");
        let writer = FilesystemReportWriter::new();
        let key = SeriesKey::new(Exchange::DydxV4, "BTC-USD", Resolution::M1);

        let mut report = QualityReport::empty(key.clone());
        report.rows = 10;
        let path = writer.write_quality_report(&dir, &report).unwrap();
        report.rows = 3;
        let again = writer.write_quality_report(&dir, &report).unwrap();
        assert_eq!(path, again);

        let stored: QualityReport =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(stored.rows, 3);
        let leftovers: Vec<_> = fs::read_dir(&dir)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn run_summary_creates_parent_dirs() {
        let dir = temp_dir("summary");
        let path = dir.join("runs").join("summary.json");
        FilesystemReportWriter::new()
            .write_run_summary(&path, &serde_json::json!({"run_id": "r1", "inserted": 4}))
            .unwrap();
        let parsed: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["inserted"], 4);
    }
}
