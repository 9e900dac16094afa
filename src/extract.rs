//! Recover labeled numeric values from an execution trace.
//!
//! Every declared label is queried once after the case script. The reply is
//! label-tagged in one of the engine's two parameter formats:
//!
//! ```text
//!  PARAMETER MAX_STRESS =     390.00000000
//!
//!  NAME                              VALUE                        TYPE  DIMENSIONS
//!  MAX_STRESS                        390.0000000                  SCALAR
//! ```
//!
//! Unparseable or absent values are data (`value: None` plus a note), not
//! errors. Only a trace whose shape contradicts the query protocol is an
//! [`ExtractError`].
use crate::catalog::VerificationCase;
use crate::runner::ExecutionTrace;
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

pub const LABEL_PLACEHOLDER: &str = "{label}";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("unexpected trace shape: {0}")]
    UnexpectedShape(String),
}

/// Outcome for one declared label.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub label: String,
    pub value: Option<f64>,
    pub note: Option<String>,
}

impl Extraction {
    fn found(label: &str, value: f64) -> Self {
        Self {
            label: label.to_string(),
            value: Some(value),
            note: None,
        }
    }

    fn missing(label: &str, note: impl Into<String>) -> Self {
        Self {
            label: label.to_string(),
            value: None,
            note: Some(note.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Tag {
    name: String,
    raw: String,
    numeric: bool,
}

fn echo_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*PARAMETER\s+([A-Za-z][A-Za-z0-9_]*)\s*=\s*(.*?)\s*$")
            .expect("regex for parameter echo")
    })
}

fn status_header_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*NAME\s+VALUE\b").expect("regex for status header")
    })
}

fn status_row_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^\s*([A-Za-z][A-Za-z0-9_]*)\s+(.*?)\s+(SCALAR|CHARACTER|STRING|ARRAY|TABLE)\b",
        )
        .expect("regex for status row")
    })
}

fn number_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[+-]?(?:\d+\.?\d*|\.\d+)(?:[EeDd][+-]?\d+)?$")
            .expect("regex for engine number")
    })
}

fn echo_tags(lines: &[String]) -> Vec<Tag> {
    lines
        .iter()
        .filter_map(|line| echo_regex().captures(line))
        .map(|caps| {
            let raw = caps[2].to_string();
            let numeric = !raw.starts_with('\'');
            Tag {
                name: caps[1].to_ascii_uppercase(),
                raw,
                numeric,
            }
        })
        .collect()
}

fn status_tags(lines: &[String]) -> Vec<Tag> {
    let Some(header) = lines
        .iter()
        .position(|line| status_header_regex().is_match(line))
    else {
        return Vec::new();
    };
    lines[header + 1..]
        .iter()
        .filter_map(|line| status_row_regex().captures(line))
        .map(|caps| Tag {
            name: caps[1].to_ascii_uppercase(),
            raw: caps[2].to_string(),
            numeric: &caps[3] == "SCALAR",
        })
        .collect()
}

/// Strict numeric parse of an engine value: finite, `D` exponents allowed.
pub fn parse_engine_number(raw: &str) -> Result<f64, String> {
    let text = raw.trim();
    if text.is_empty() {
        return Err("empty value".to_string());
    }
    if !number_regex().is_match(text) {
        return Err(format!("non-numeric value {text:?}"));
    }
    let value: f64 = text
        .replace(['D', 'd'], "E")
        .parse()
        .map_err(|err| format!("unparseable value {text:?}: {err}"))?;
    if !value.is_finite() {
        return Err(format!("non-finite value {text:?}"));
    }
    Ok(value)
}

#[derive(Debug, Clone)]
pub struct Extractor {
    query_template: String,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new("*STATUS,{label}")
    }
}

impl Extractor {
    pub fn new(query_template: impl Into<String>) -> Self {
        Self {
            query_template: query_template.into(),
        }
    }

    pub fn query_command(&self, label: &str) -> String {
        self.query_template
            .replace(LABEL_PLACEHOLDER, &label.to_ascii_uppercase())
    }

    /// Query commands to append after a case's script, in label order.
    pub fn queries(&self, case: &VerificationCase) -> Vec<String> {
        case.labels().map(|label| self.query_command(label)).collect()
    }

    /// One `Extraction` per declared label, in declared order.
    pub fn extract(
        &self,
        case: &VerificationCase,
        trace: &ExecutionTrace,
    ) -> Result<Vec<Extraction>, ExtractError> {
        if !trace.is_completed() {
            return Err(ExtractError::UnexpectedShape(
                "trace did not reach end of script".to_string(),
            ));
        }
        let queries = self.queries(case);
        let mut out = Vec::with_capacity(queries.len());
        for (label, query) in case.labels().zip(&queries) {
            let chunk = trace.reply_to(query).ok_or_else(|| {
                ExtractError::UnexpectedShape(format!("no reply to query {query:?}"))
            })?;
            let wanted = label.to_ascii_uppercase();
            let mut tags = status_tags(&chunk.lines);
            tags.extend(echo_tags(&chunk.lines));

            let extraction = match tags.iter().rev().find(|tag| tag.name == wanted) {
                Some(tag) => from_tag(label, tag),
                None if !tags.is_empty() => {
                    let names: Vec<&str> = tags.iter().map(|tag| tag.name.as_str()).collect();
                    return Err(ExtractError::UnexpectedShape(format!(
                        "reply to {query:?} reports {} instead of {wanted}",
                        names.join(", ")
                    )));
                }
                None => self.fallback(label, &wanted, trace, &queries),
            };
            if extraction.value.is_none() {
                tracing::debug!(case_id = %case.id, label, note = ?extraction.note, "label missing");
            }
            out.push(extraction);
        }
        Ok(out)
    }

    /// Last `PARAMETER NAME = ...` echo in the script output proper.
    fn fallback(
        &self,
        label: &str,
        wanted: &str,
        trace: &ExecutionTrace,
        queries: &[String],
    ) -> Extraction {
        let echoed = trace
            .chunks()
            .iter()
            .rev()
            .filter(|chunk| !queries.iter().any(|q| q.eq_ignore_ascii_case(&chunk.command)))
            .flat_map(|chunk| echo_tags(&chunk.lines).into_iter().rev())
            .find(|tag| tag.name == wanted);
        match echoed {
            Some(tag) => from_tag(label, &tag),
            None => Extraction::missing(label, format!("{wanted} never reported by the engine")),
        }
    }
}

fn from_tag(label: &str, tag: &Tag) -> Extraction {
    if !tag.numeric {
        return Extraction::missing(label, format!("{} is not numeric ({})", tag.name, tag.raw));
    }
    match parse_engine_number(&tag.raw) {
        Ok(value) => Extraction::found(label, value),
        Err(reason) => Extraction::missing(label, reason),
    }
}
