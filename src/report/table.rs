//! Human-readable comparison table.
use super::{RunReport, RunSummary};
use crate::compare::Verdict;
use crate::util::truncate_string;
use std::fmt::Write as _;

/// Failure messages and notes are cut to this many bytes.
const MESSAGE_WIDTH: usize = 160;

const HEADERS: [&str; 7] = ["CASE", "LABEL", "UNIT", "TARGET", "COMPUTED", "RATIO", "VERDICT"];

fn format_value(value: Option<f64>) -> String {
    match value {
        Some(value) if value != 0.0 && (value.abs() >= 1e6 || value.abs() < 1e-3) => {
            format!("{value:.5e}")
        }
        Some(value) => {
            let text = format!("{value:.6}");
            let text = text.trim_end_matches('0').trim_end_matches('.');
            if text.is_empty() || text == "-" {
                "0".to_string()
            } else {
                text.to_string()
            }
        }
        None => "-".to_string(),
    }
}

fn format_ratio(ratio: Option<f64>) -> String {
    ratio.map_or_else(|| "-".to_string(), |ratio| format!("{ratio:.4}"))
}

pub fn summary_line(summary: &RunSummary) -> String {
    format!(
        "{} cases ({} passed, {} failed); {} results: {} {}, {} {}, {} {}, {} {}",
        summary.cases,
        summary.cases_passed,
        summary.cases_failed,
        summary.results,
        summary.count(Verdict::Pass),
        Verdict::Pass,
        summary.count(Verdict::Fail),
        Verdict::Fail,
        summary.count(Verdict::Missing),
        Verdict::Missing,
        summary.count(Verdict::Error),
        Verdict::Error,
    )
}

/// Render the report as a fixed-width table followed by failures and summary.
pub fn render_table(report: &RunReport) -> String {
    let rows: Vec<[String; 7]> = report
        .results()
        .map(|result| {
            [
                result.case_id.clone(),
                result.label.clone(),
                result.unit.clone(),
                format_value(Some(result.target)),
                format_value(result.computed),
                format_ratio(result.ratio),
                result.verdict.to_string(),
            ]
        })
        .collect();

    let mut widths = HEADERS.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    let header = HEADERS.map(str::to_string);
    for row in std::iter::once(&header).chain(rows.iter()) {
        let mut line = String::new();
        for (idx, (cell, width)) in row.iter().zip(widths).enumerate() {
            if idx > 0 {
                line.push_str("  ");
            }
            // Numeric columns right-aligned.
            if (3..6).contains(&idx) {
                let _ = write!(line, "{cell:>width$}");
            } else {
                let _ = write!(line, "{cell:<width$}");
            }
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }

    let failed: Vec<_> = report
        .cases
        .iter()
        .filter_map(|case| case.failure.as_ref().map(|failure| (case, failure)))
        .collect();
    if !failed.is_empty() {
        out.push('\n');
        for (case, failure) in failed {
            let _ = writeln!(
                out,
                "{} failed at {} ({}): {}",
                case.case_id,
                failure.stage,
                failure.kind.as_str(),
                truncate_string(failure.message.lines().next().unwrap_or(""), MESSAGE_WIDTH)
            );
        }
    }
    let notes: Vec<_> = report
        .results()
        .filter(|result| result.verdict != Verdict::Pass && result.note.is_some())
        .collect();
    if !notes.is_empty() {
        out.push('\n');
        for result in notes {
            let _ = writeln!(
                out,
                "{}/{}: {}",
                result.case_id,
                result.label,
                truncate_string(result.note.as_deref().unwrap_or(""), MESSAGE_WIDTH)
            );
        }
    }

    out.push('\n');
    let _ = writeln!(out, "{}", summary_line(&report.summary));
    if report.aborted {
        out.push_str("run aborted before all cases started\n");
    }
    let _ = writeln!(out, "overall: {}", report.verdict);
    out
}
