//! Read-only comparison of a run against a stored baseline report.
use super::{RunReport, REPORT_SCHEMA_VERSION};
use crate::compare::Verdict;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffKind {
    /// PASS in the baseline, anything else now.
    Regression,
    Fixed,
    /// Non-PASS in both runs; expected flakiness rather than a regression.
    StillFailing,
    Unchanged,
    New,
    Removed,
}

impl DiffKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Regression => "regression",
            Self::Fixed => "fixed",
            Self::StillFailing => "still_failing",
            Self::Unchanged => "unchanged",
            Self::New => "new",
            Self::Removed => "removed",
        }
    }
}

pub fn classify(baseline: Option<Verdict>, current: Option<Verdict>) -> DiffKind {
    match (baseline, current) {
        (None, _) => DiffKind::New,
        (Some(_), None) => DiffKind::Removed,
        (Some(before), Some(after)) => match (before.is_pass(), after.is_pass()) {
            (true, true) => DiffKind::Unchanged,
            (true, false) => DiffKind::Regression,
            (false, true) => DiffKind::Fixed,
            (false, false) => DiffKind::StillFailing,
        },
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub case_id: String,
    pub label: String,
    pub baseline: Option<Verdict>,
    pub current: Option<Verdict>,
    pub kind: DiffKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub regression: usize,
    pub fixed: usize,
    pub still_failing: usize,
    pub unchanged: usize,
    pub new: usize,
    pub removed: usize,
}

impl DiffSummary {
    fn add(&mut self, kind: DiffKind) {
        let slot = match kind {
            DiffKind::Regression => &mut self.regression,
            DiffKind::Fixed => &mut self.fixed,
            DiffKind::StillFailing => &mut self.still_failing,
            DiffKind::Unchanged => &mut self.unchanged,
            DiffKind::New => &mut self.new,
            DiffKind::Removed => &mut self.removed,
        };
        *slot += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportDiff {
    pub schema_version: u32,
    pub baseline_generated_at_epoch_ms: u128,
    pub current_generated_at_epoch_ms: u128,
    pub summary: DiffSummary,
    pub entries: Vec<DiffEntry>,
}

impl ReportDiff {
    pub fn has_regressions(&self) -> bool {
        self.regressions().next().is_some()
    }

    /// Every entry except the unchanged ones.
    pub fn changes(&self) -> impl Iterator<Item = &DiffEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.kind != DiffKind::Unchanged)
    }

    pub fn regressions(&self) -> impl Iterator<Item = &DiffEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.kind == DiffKind::Regression)
    }
}

/// Compare verdicts keyed by (case id, label). Entries follow the current
/// report's order; labels only present in the baseline come last.
pub fn diff_reports(baseline: &RunReport, current: &RunReport) -> ReportDiff {
    let before: BTreeMap<(&str, &str), Verdict> = baseline
        .results()
        .map(|r| ((r.case_id.as_str(), r.label.as_str()), r.verdict))
        .collect();
    let mut seen = BTreeSet::new();
    let mut entries = Vec::new();
    let mut summary = DiffSummary::default();

    for result in current.results() {
        let key = (result.case_id.as_str(), result.label.as_str());
        seen.insert(key);
        let baseline_verdict = before.get(&key).copied();
        let kind = classify(baseline_verdict, Some(result.verdict));
        summary.add(kind);
        entries.push(DiffEntry {
            case_id: result.case_id.clone(),
            label: result.label.clone(),
            baseline: baseline_verdict,
            current: Some(result.verdict),
            kind,
        });
    }
    for result in baseline.results() {
        let key = (result.case_id.as_str(), result.label.as_str());
        if seen.contains(&key) {
            continue;
        }
        summary.add(DiffKind::Removed);
        entries.push(DiffEntry {
            case_id: result.case_id.clone(),
            label: result.label.clone(),
            baseline: Some(result.verdict),
            current: None,
            kind: DiffKind::Removed,
        });
    }

    ReportDiff {
        schema_version: REPORT_SCHEMA_VERSION,
        baseline_generated_at_epoch_ms: baseline.generated_at_epoch_ms,
        current_generated_at_epoch_ms: current.generated_at_epoch_ms,
        summary,
        entries,
    }
}
