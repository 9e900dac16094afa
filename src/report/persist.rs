//! Report artifacts on disk.
//!
//! `report.json` is a snapshot written atomically, `history.jsonl` is
//! append-only. A baseline file is only ever replaced by [`promote`].
use super::diff::ReportDiff;
use super::table::render_table;
use super::{RunReport, RunSummary, RunVerdict, REPORT_SCHEMA_VERSION};
use crate::util::{read_json, write_json_atomic, write_text_atomic};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Layout of the output directory.
#[derive(Debug, Clone)]
pub struct OutputPaths {
    root: PathBuf,
}

impl OutputPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn report_path(&self) -> PathBuf {
        self.root.join("report.json")
    }

    pub fn text_path(&self) -> PathBuf {
        self.root.join("report.txt")
    }

    pub fn history_path(&self) -> PathBuf {
        self.root.join("history.jsonl")
    }

    pub fn diff_path(&self) -> PathBuf {
        self.root.join("diff.json")
    }
}

/// One line of `history.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub schema_version: u32,
    pub generated_at_epoch_ms: u128,
    pub engine: String,
    pub verdict: RunVerdict,
    pub aborted: bool,
    pub summary: RunSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regressions: Option<usize>,
}

impl HistoryEntry {
    pub fn from_report(report: &RunReport, diff: Option<&ReportDiff>) -> Self {
        Self {
            schema_version: REPORT_SCHEMA_VERSION,
            generated_at_epoch_ms: report.generated_at_epoch_ms,
            engine: report.engine.clone(),
            verdict: report.verdict,
            aborted: report.aborted,
            summary: report.summary.clone(),
            regressions: diff.map(|diff| diff.summary.regression),
        }
    }
}

/// Write `report.json` and `report.txt`.
pub fn write_report(paths: &OutputPaths, report: &RunReport) -> Result<()> {
    write_json_atomic(&paths.report_path(), report).context("write run report")?;
    write_text_atomic(&paths.text_path(), &render_table(report)).context("write report table")?;
    Ok(())
}

pub fn write_diff(paths: &OutputPaths, diff: &ReportDiff) -> Result<()> {
    write_json_atomic(&paths.diff_path(), diff).context("write baseline diff")
}

/// Load a persisted report, rejecting unknown schema versions.
pub fn load_report(path: &Path) -> Result<RunReport> {
    let report: RunReport = read_json(path)?;
    if report.schema_version != REPORT_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported report schema_version {} in {}",
            report.schema_version,
            path.display()
        ));
    }
    Ok(report)
}

/// Append a history entry as JSONL.
pub fn append_history(paths: &OutputPaths, entry: &HistoryEntry) -> Result<()> {
    let path = paths.history_path();
    fs::create_dir_all(paths.root())
        .with_context(|| format!("create {}", paths.root().display()))?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open {}", path.display()))?;
    let line = serde_json::to_string(entry).context("serialize history entry")?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("write {}", path.display()))?;
    file.write_all(b"\n")
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

pub fn read_history(path: &Path) -> Result<Vec<HistoryEntry>> {
    let file = fs::File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut entries = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let entry = serde_json::from_str(&line)
            .with_context(|| format!("parse {} line {}", path.display(), idx + 1))?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Replace `baseline` with the report at `report_path`.
pub fn promote(report_path: &Path, baseline: &Path) -> Result<()> {
    let report = load_report(report_path)?;
    write_json_atomic(baseline, &report)
        .with_context(|| format!("promote {} to baseline", report_path.display()))?;
    tracing::info!(
        report = %report_path.display(),
        baseline = %baseline.display(),
        verdict = %report.verdict,
        "promoted run to baseline"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::state::CaseState;
    use crate::report::diff::diff_reports;
    use crate::report::tests::sample_case;
    use crate::report::{CaseReport, ComparisonResult};

    fn report(computed: f64) -> RunReport {
        let case = sample_case("vm1", &[("a", 100.0)]);
        let results = vec![ComparisonResult::compared(
            &case.id,
            &case.expected[0],
            Some(computed),
            None,
        )];
        RunReport::new(
            "mock",
            vec![CaseReport::new("vm1", CaseState::Done, None, 1, 3, results)],
            false,
        )
    }

    #[test]
    fn writes_snapshot_table_and_history() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = OutputPaths::new(dir.path().join("out"));
        let first = report(100.0);
        write_report(&paths, &first).expect("write");
        append_history(&paths, &HistoryEntry::from_report(&first, None)).expect("history");
        let second = report(150.0);
        let diff = diff_reports(&first, &second);
        append_history(&paths, &HistoryEntry::from_report(&second, Some(&diff)))
            .expect("history");

        let loaded = load_report(&paths.report_path()).expect("load");
        assert_eq!(loaded.verdict, RunVerdict::Pass);
        let table = fs::read_to_string(paths.text_path()).expect("table");
        assert!(table.contains("vm1"));

        let history = read_history(&paths.history_path()).expect("read history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].regressions, None);
        assert_eq!(history[1].regressions, Some(1));
        assert_eq!(history[1].verdict, RunVerdict::Fail);
    }

    #[test]
    fn promote_replaces_baseline_only_when_called() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = OutputPaths::new(dir.path());
        let baseline = dir.path().join("baseline.json");
        write_json_atomic(&baseline, &report(100.0)).expect("seed baseline");
        write_report(&paths, &report(150.0)).expect("write");

        let before = load_report(&baseline).expect("baseline");
        assert_eq!(before.verdict, RunVerdict::Pass);

        promote(&paths.report_path(), &baseline).expect("promote");
        let after = load_report(&baseline).expect("baseline");
        assert_eq!(after.verdict, RunVerdict::Fail);
    }

    #[test]
    fn load_rejects_unknown_schema() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("report.json");
        let mut value = serde_json::to_value(report(100.0)).expect("value");
        value["schema_version"] = serde_json::json!(99);
        write_json_atomic(&path, &value).expect("write");
        let err = load_report(&path).expect_err("schema");
        assert!(err.to_string().contains("schema_version"));
    }
}
