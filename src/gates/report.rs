//! Gate Report Persistence
//!
//! Writes gate results and session summaries as JSON under the configured
//! reports directory. Files land via temp-file-then-rename so a crash or
//! signal mid-write never leaves a truncated report behind.

use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

use super::GateResult;
use crate::error::Result;

/// Writes audit artifacts for one orchestrator run
#[derive(Debug, Clone)]
pub struct ReportWriter {
    reports_dir: PathBuf,
}

impl ReportWriter {
    pub fn new<P: Into<PathBuf>>(reports_dir: P) -> Self {
        Self {
            reports_dir: reports_dir.into(),
        }
    }

    /// Persist one gate invocation's result; filename carries the gate name
    /// and a UTC timestamp so repeated runs never clobber each other.
    pub fn write_gate_report(&self, result: &GateResult) -> Result<PathBuf> {
        let stamp = result.evaluated_at.format("%Y%m%dT%H%M%S%.3fZ");
        let name = format!("{}_{}.json", result.gate, stamp);
        self.write_json(&name, result)
    }

    /// Persist an arbitrary JSON artifact (session summaries use this)
    pub fn write_json<T: Serialize>(&self, file_name: &str, value: &T) -> Result<PathBuf> {
        fs::create_dir_all(&self.reports_dir)?;
        let path = self.reports_dir.join(file_name);
        let body = serde_json::to_string_pretty(value)?;
        atomic_write(&path, body.as_bytes())?;
        info!(path = %path.display(), "report written");
        Ok(path)
    }
}

/// Write a file atomically (temp file + rename)
fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or(Path::new("."));
    let temp_name = format!(
        ".tmp_{}_{}",
        std::process::id(),
        path.file_name()
            .map(|s| s.to_string_lossy())
            .unwrap_or_default()
    );
    let temp_path = parent.join(&temp_name);

    let mut file = fs::File::create(&temp_path)?;
    file.write_all(data)?;
    file.sync_all()?;
    fs::rename(&temp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::{evaluate, Comparator, MetricsMap, Threshold, Verdict};
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn sample_result() -> GateResult {
        let mut thresholds = BTreeMap::new();
        thresholds.insert(
            "win_rate".to_string(),
            Threshold {
                op: Comparator::Gte,
                limit: dec!(0.30),
            },
        );
        let mut metrics = MetricsMap::new();
        metrics.insert("win_rate".to_string(), dec!(0.28));
        evaluate("performance", &thresholds, &metrics)
    }

    #[test]
    fn test_gate_report_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ReportWriter::new(dir.path());
        let result = sample_result();

        let path = writer.write_gate_report(&result).unwrap();
        assert!(path.exists());

        let body = fs::read_to_string(&path).unwrap();
        let parsed: GateResult = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed.gate, "performance");
        assert_eq!(parsed.verdict, Verdict::Fail);
        assert_eq!(parsed.violations.len(), 1);
        assert_eq!(parsed.violations[0].actual, Some(dec!(0.28)));
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ReportWriter::new(dir.path());
        writer.write_gate_report(&sample_result()).unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp_"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_reports_dir_created_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("audit").join("2026");
        let writer = ReportWriter::new(&nested);
        writer.write_gate_report(&sample_result()).unwrap();
        assert!(nested.is_dir());
    }
}
