//! Run report model and the synchronized aggregator that builds it.
//!
//! The aggregator is passed explicitly to every worker; it is the only
//! report state shared across concurrently executing cases.
pub mod diff;
pub mod persist;
pub mod table;

use crate::catalog::{ExpectedValue, VerificationCase};
use crate::compare::{compare, Tolerance, Verdict};
use crate::orchestrator::state::{CaseFailure, CaseState, FailureKind};
use crate::util::now_epoch_ms;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

pub const REPORT_SCHEMA_VERSION: u32 = 1;

/// Outcome for one (case, label) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub case_id: String,
    pub label: String,
    #[serde(default)]
    pub unit: String,
    pub computed: Option<f64>,
    pub target: f64,
    pub tolerance: Tolerance,
    pub ratio: Option<f64>,
    pub deviation: Option<f64>,
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ComparisonResult {
    /// Classify an extracted value; `None` yields MISSING with `note`.
    pub fn compared(
        case_id: &str,
        expected: &ExpectedValue,
        computed: Option<f64>,
        note: Option<String>,
    ) -> Self {
        let outcome = compare(computed, expected.target, &expected.tolerance);
        Self {
            case_id: case_id.to_string(),
            label: expected.label.clone(),
            unit: expected.unit.clone(),
            computed,
            target: expected.target,
            tolerance: expected.tolerance,
            ratio: outcome.ratio,
            deviation: outcome.deviation,
            verdict: outcome.verdict,
            note: outcome.note.or(note),
        }
    }

    /// Result for a label whose value could not be produced at all.
    pub fn unavailable(
        case_id: &str,
        expected: &ExpectedValue,
        verdict: Verdict,
        note: impl Into<String>,
    ) -> Self {
        Self {
            case_id: case_id.to_string(),
            label: expected.label.clone(),
            unit: expected.unit.clone(),
            computed: None,
            target: expected.target,
            tolerance: expected.tolerance,
            ratio: None,
            deviation: None,
            verdict,
            note: Some(note.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunVerdict {
    Pass,
    Fail,
}

impl RunVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
        }
    }

    fn from_results<'a>(results: impl IntoIterator<Item = &'a ComparisonResult>) -> Self {
        let mut any = false;
        for result in results {
            any = true;
            if !result.verdict.is_pass() {
                return Self::Fail;
            }
        }
        if any {
            Self::Pass
        } else {
            Self::Fail
        }
    }
}

impl fmt::Display for RunVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseReport {
    pub case_id: String,
    pub verdict: RunVerdict,
    pub final_state: CaseState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<CaseFailure>,
    pub attempts: u32,
    pub duration_ms: u64,
    pub results: Vec<ComparisonResult>,
}

impl CaseReport {
    pub fn new(
        case_id: &str,
        final_state: CaseState,
        failure: Option<CaseFailure>,
        attempts: u32,
        duration_ms: u64,
        results: Vec<ComparisonResult>,
    ) -> Self {
        let verdict = if failure.is_some() {
            RunVerdict::Fail
        } else {
            RunVerdict::from_results(&results)
        };
        Self {
            case_id: case_id.to_string(),
            verdict,
            final_state,
            failure,
            attempts,
            duration_ms,
            results,
        }
    }

    /// Record for a case that never started because the run was aborted.
    pub fn aborted(case: &VerificationCase) -> Self {
        let results = case
            .expected
            .iter()
            .map(|expected| {
                ComparisonResult::unavailable(&case.id, expected, Verdict::Missing, "run aborted")
            })
            .collect();
        let failure = CaseFailure {
            stage: CaseState::Pending,
            kind: FailureKind::Aborted,
            message: "run aborted before the case started".to_string(),
        };
        Self::new(&case.id, CaseState::Failed, Some(failure), 0, 0, results)
    }

    /// The case got as far as numeric comparison.
    pub fn reached_comparison(&self) -> bool {
        self.final_state == CaseState::Done
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub cases: usize,
    pub cases_passed: usize,
    pub cases_failed: usize,
    pub results: usize,
    pub pass: usize,
    pub fail: usize,
    pub missing: usize,
    pub error: usize,
}

impl RunSummary {
    pub fn from_cases(cases: &[CaseReport]) -> Self {
        let mut summary = Self {
            cases: cases.len(),
            ..Self::default()
        };
        for case in cases {
            match case.verdict {
                RunVerdict::Pass => summary.cases_passed += 1,
                RunVerdict::Fail => summary.cases_failed += 1,
            }
            for result in &case.results {
                summary.results += 1;
                match result.verdict {
                    Verdict::Pass => summary.pass += 1,
                    Verdict::Fail => summary.fail += 1,
                    Verdict::Missing => summary.missing += 1,
                    Verdict::Error => summary.error += 1,
                }
            }
        }
        summary
    }

    pub fn count(&self, verdict: Verdict) -> usize {
        match verdict {
            Verdict::Pass => self.pass,
            Verdict::Fail => self.fail,
            Verdict::Missing => self.missing,
            Verdict::Error => self.error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub schema_version: u32,
    pub generated_at_epoch_ms: u128,
    pub engine: String,
    pub verdict: RunVerdict,
    pub summary: RunSummary,
    #[serde(default)]
    pub aborted: bool,
    pub cases: Vec<CaseReport>,
}

impl RunReport {
    pub fn new(engine: impl Into<String>, cases: Vec<CaseReport>, aborted: bool) -> Self {
        let verdict = if !cases.is_empty()
            && cases.iter().all(|case| case.verdict == RunVerdict::Pass)
        {
            RunVerdict::Pass
        } else {
            RunVerdict::Fail
        };
        Self {
            schema_version: REPORT_SCHEMA_VERSION,
            generated_at_epoch_ms: now_epoch_ms(),
            engine: engine.into(),
            verdict,
            summary: RunSummary::from_cases(&cases),
            aborted,
            cases,
        }
    }

    pub fn results(&self) -> impl Iterator<Item = &ComparisonResult> {
        self.cases.iter().flat_map(|case| case.results.iter())
    }

    pub fn case(&self, case_id: &str) -> Option<&CaseReport> {
        self.cases.iter().find(|case| case.case_id == case_id)
    }

    /// Every case failed before numeric comparison.
    pub fn infrastructure_failure(&self) -> bool {
        !self.cases.iter().any(CaseReport::reached_comparison)
    }

    /// 0 on PASS, 1 on verification failures, 2 when no case got as far
    /// as comparison.
    pub fn exit_code(&self) -> i32 {
        match self.verdict {
            RunVerdict::Pass => 0,
            RunVerdict::Fail if self.infrastructure_failure() => 2,
            RunVerdict::Fail => 1,
        }
    }
}

/// Thread-safe accumulation of case reports, emitted in catalog order.
pub struct ReportAggregator {
    engine: String,
    cases: Vec<VerificationCase>,
    recorded: Mutex<BTreeMap<String, CaseReport>>,
}

impl ReportAggregator {
    pub fn new(engine: impl Into<String>, cases: &[VerificationCase]) -> Self {
        Self {
            engine: engine.into(),
            cases: cases.to_vec(),
            recorded: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn record_case(&self, report: CaseReport) {
        debug_assert!(
            report.final_state.is_terminal(),
            "case {} recorded in non-terminal state {}",
            report.case_id,
            report.final_state
        );
        tracing::info!(
            case_id = %report.case_id,
            verdict = %report.verdict,
            final_state = %report.final_state,
            attempts = report.attempts,
            elapsed_ms = report.duration_ms,
            "case complete"
        );
        let mut recorded = self.recorded.lock().unwrap_or_else(PoisonError::into_inner);
        if recorded.insert(report.case_id.clone(), report).is_some() {
            tracing::warn!("case recorded twice; keeping the latest report");
        }
    }

    pub fn recorded(&self) -> usize {
        self.recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Build the run report. Every declared expectation appears exactly once:
    /// unrecorded cases become aborted records and unreported labels MISSING.
    pub fn finish(self, aborted: bool) -> RunReport {
        let mut recorded = self
            .recorded
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        let cases = self
            .cases
            .iter()
            .map(|case| match recorded.remove(&case.id) {
                Some(report) => complete_results(case, report),
                None => CaseReport::aborted(case),
            })
            .collect();
        RunReport::new(self.engine, cases, aborted)
    }
}

/// Reorder results into declared label order, filling gaps with MISSING.
fn complete_results(case: &VerificationCase, mut report: CaseReport) -> CaseReport {
    let mut by_label: BTreeMap<String, ComparisonResult> = report
        .results
        .drain(..)
        .map(|result| (result.label.clone(), result))
        .collect();
    let results = case
        .expected
        .iter()
        .map(|expected| {
            by_label.remove(&expected.label).unwrap_or_else(|| {
                ComparisonResult::unavailable(
                    &case.id,
                    expected,
                    Verdict::Missing,
                    "no result recorded",
                )
            })
        })
        .collect();
    CaseReport::new(
        &case.id,
        report.final_state,
        report.failure,
        report.attempts,
        report.duration_ms,
        results,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ScriptRef;

    pub(crate) fn sample_case(id: &str, labels: &[(&str, f64)]) -> VerificationCase {
        VerificationCase {
            id: id.to_string(),
            description: None,
            script: ScriptRef::Inline(Vec::new()),
            expected: labels
                .iter()
                .map(|(label, target)| ExpectedValue {
                    label: label.to_string(),
                    unit: "psi".to_string(),
                    target: *target,
                    tolerance: Tolerance::relative(0.05),
                })
                .collect(),
        }
    }

    fn done(case: &VerificationCase, computed: &[Option<f64>]) -> CaseReport {
        let results = case
            .expected
            .iter()
            .zip(computed)
            .map(|(expected, value)| ComparisonResult::compared(&case.id, expected, *value, None))
            .collect();
        CaseReport::new(&case.id, CaseState::Done, None, 1, 5, results)
    }

    #[test]
    fn beam_scenario_pass_and_fail() {
        let case = sample_case("beam-bend-1", &[("max_stress", 387.28)]);
        let pass = done(&case, &[Some(390.0)]);
        assert_eq!(pass.verdict, RunVerdict::Pass);
        let ratio = pass.results[0].ratio.expect("ratio");
        assert!((ratio - 1.0070).abs() < 1e-4);

        let fail = done(&case, &[Some(420.0)]);
        assert_eq!(fail.verdict, RunVerdict::Fail);
        assert_eq!(fail.results[0].verdict, Verdict::Fail);
    }

    #[test]
    fn one_missing_label_fails_case_and_run() {
        let case = sample_case("two", &[("a", 1.0), ("b", 2.0)]);
        let report = done(&case, &[Some(1.0), None]);
        assert_eq!(report.results[0].verdict, Verdict::Pass);
        assert_eq!(report.results[1].verdict, Verdict::Missing);
        assert_eq!(report.verdict, RunVerdict::Fail);

        let run = RunReport::new("mock", vec![report], false);
        assert_eq!(run.verdict, RunVerdict::Fail);
        assert_eq!(run.summary.missing, 1);
        assert_eq!(run.exit_code(), 1);
    }

    #[test]
    fn aggregator_preserves_catalog_order_and_fills_gaps() {
        let first = sample_case("first", &[("a", 1.0)]);
        let second = sample_case("second", &[("a", 1.0), ("b", 1.0)]);
        let third = sample_case("third", &[("c", 1.0)]);
        let aggregator = ReportAggregator::new("mock", &[first.clone(), second.clone(), third]);

        let mut partial = done(&second, &[Some(1.0), Some(1.0)]);
        partial.results.remove(0);
        aggregator.record_case(partial);
        aggregator.record_case(done(&first, &[Some(1.0)]));
        assert_eq!(aggregator.recorded(), 2);

        let run = aggregator.finish(true);
        let ids: Vec<&str> = run.cases.iter().map(|c| c.case_id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
        assert_eq!(run.results().count(), 4);
        assert_eq!(run.cases[1].results[0].label, "a");
        assert_eq!(run.cases[1].results[0].verdict, Verdict::Missing);
        let third = &run.cases[2];
        assert_eq!(third.final_state, CaseState::Failed);
        assert_eq!(
            third.failure.as_ref().map(|f| f.kind),
            Some(FailureKind::Aborted)
        );
        assert!(run.aborted);
    }

    #[test]
    fn exit_code_distinguishes_infrastructure_failure() {
        let case = sample_case("vm1", &[("a", 1.0)]);
        let pass = RunReport::new("mock", vec![done(&case, &[Some(1.0)])], false);
        assert_eq!(pass.exit_code(), 0);

        let infra = RunReport::new("mock", vec![CaseReport::aborted(&case)], true);
        assert!(infra.infrastructure_failure());
        assert_eq!(infra.exit_code(), 2);
    }

    #[test]
    fn report_json_uses_stable_field_names() {
        let case = sample_case("vm1", &[("a", 2.0)]);
        let run = RunReport::new("mock", vec![done(&case, &[Some(2.0)])], false);
        let value = serde_json::to_value(&run).expect("serialize");
        assert_eq!(value["verdict"], "pass");
        assert_eq!(value["cases"][0]["final_state"], "DONE");
        assert_eq!(value["cases"][0]["results"][0]["ratio"], 1.0);
        assert_eq!(value["cases"][0]["results"][0]["tolerance"]["kind"], "relative");
        let back: RunReport = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back.cases[0].results[0].verdict, Verdict::Pass);
        assert_eq!(back.summary, run.summary);
    }
}
