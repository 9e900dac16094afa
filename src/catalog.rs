//! Verification case catalog.
//!
//! The catalog file is parsed and validated as a whole before any case is
//! exposed, so a single malformed case rejects the load instead of silently
//! dropping out of the run.
use crate::compare::Tolerance;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CATALOG_SCHEMA_VERSION: u32 = 1;

/// Longest parameter name the engine accepts.
pub const MAX_LABEL_LEN: usize = 32;

/// Malformed catalog. Always fatal to the whole run.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("read catalog {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse catalog {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported catalog schema_version {0} (expected {CATALOG_SCHEMA_VERSION})")]
    SchemaVersion(u32),
    #[error("case {case_id:?}: {message}")]
    InvalidCase { case_id: String, message: String },
    #[error("unknown case id {0:?}")]
    UnknownCase(String),
    #[error("read script for case {case_id:?} ({path}): {source}")]
    Script {
        case_id: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn invalid(case_id: &str, message: impl Into<String>) -> CatalogError {
    CatalogError::InvalidCase {
        case_id: case_id.to_string(),
        message: message.into(),
    }
}

/// On-disk catalog document.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct CatalogFile {
    pub schema_version: u32,
    #[serde(default)]
    pub cases: Vec<CaseEntry>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct CaseEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub script: ScriptEntry,
    #[serde(default)]
    pub expected: Vec<ExpectedValue>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct ScriptEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<Vec<String>>,
}

/// One labeled quantity a case must produce.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ExpectedValue {
    pub label: String,
    #[serde(default)]
    pub unit: String,
    pub target: f64,
    pub tolerance: Tolerance,
}

/// Where a case's command sequence comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptRef {
    File(PathBuf),
    Inline(Vec<String>),
}

/// Commands ready to stream to a session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Script {
    pub commands: Vec<String>,
}

impl Script {
    /// Split script text into commands, skipping blanks and `!` comments.
    pub fn parse(text: &str) -> Self {
        let commands = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('!'))
            .map(str::to_string)
            .collect();
        Self { commands }
    }

    pub fn push(&mut self, command: impl Into<String>) {
        self.commands.push(command.into());
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Validated, immutable verification case.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationCase {
    pub id: String,
    pub description: Option<String>,
    pub script: ScriptRef,
    pub expected: Vec<ExpectedValue>,
}

impl VerificationCase {
    pub fn load_script(&self) -> Result<Script, CatalogError> {
        match &self.script {
            ScriptRef::Inline(lines) => Ok(Script::parse(&lines.join("\n"))),
            ScriptRef::File(path) => {
                let text = fs::read_to_string(path).map_err(|source| CatalogError::Script {
                    case_id: self.id.clone(),
                    path: path.clone(),
                    source,
                })?;
                Ok(Script::parse(&text))
            }
        }
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.expected.iter().map(|value| value.label.as_str())
    }
}

/// A fully validated set of cases in file order.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    cases: Vec<VerificationCase>,
}

impl Catalog {
    /// Load and validate a catalog file; script paths resolve against its directory.
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let bytes = fs::read(path).map_err(|source| CatalogError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: CatalogFile =
            serde_json::from_slice(&bytes).map_err(|source| CatalogError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_file(file, base)
    }

    pub fn from_file(file: CatalogFile, base: &Path) -> Result<Self, CatalogError> {
        if file.schema_version != CATALOG_SCHEMA_VERSION {
            return Err(CatalogError::SchemaVersion(file.schema_version));
        }
        let mut seen_ids = BTreeSet::new();
        let mut cases = Vec::with_capacity(file.cases.len());
        for entry in file.cases {
            let case = validate_case(entry, base)?;
            if !seen_ids.insert(case.id.clone()) {
                return Err(invalid(&case.id, "duplicate case id"));
            }
            cases.push(case);
        }
        Ok(Self { cases })
    }

    pub fn from_cases(cases: Vec<VerificationCase>) -> Result<Self, CatalogError> {
        let mut seen_ids = BTreeSet::new();
        for case in &cases {
            validate_expected(&case.id, &case.expected)?;
            if !seen_ids.insert(case.id.clone()) {
                return Err(invalid(&case.id, "duplicate case id"));
            }
        }
        Ok(Self { cases })
    }

    /// Restrict to the given ids, keeping catalog order.
    pub fn select(&self, ids: &[String]) -> Result<Self, CatalogError> {
        if ids.is_empty() {
            return Ok(self.clone());
        }
        for id in ids {
            if !self.cases.iter().any(|case| &case.id == id) {
                return Err(CatalogError::UnknownCase(id.clone()));
            }
        }
        let cases = self
            .cases
            .iter()
            .filter(|case| ids.contains(&case.id))
            .cloned()
            .collect();
        Ok(Self { cases })
    }

    pub fn cases(&self) -> &[VerificationCase] {
        &self.cases
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    pub fn expectation_count(&self) -> usize {
        self.cases.iter().map(|case| case.expected.len()).sum()
    }
}

fn validate_case(entry: CaseEntry, base: &Path) -> Result<VerificationCase, CatalogError> {
    let id = entry.id.trim().to_string();
    if id.is_empty() {
        return Err(invalid(&entry.id, "case id must be non-empty"));
    }
    if id.chars().any(char::is_whitespace) {
        return Err(invalid(&id, "case id must not contain whitespace"));
    }

    let script = match (entry.script.path, entry.script.inline) {
        (Some(_), Some(_)) => {
            return Err(invalid(&id, "script must set exactly one of path or inline"));
        }
        (None, None) => return Err(invalid(&id, "script reference is missing")),
        (Some(rel), None) => {
            let rel = rel.trim();
            if rel.is_empty() {
                return Err(invalid(&id, "script path must be non-empty"));
            }
            let path = base.join(rel);
            if !path.is_file() {
                return Err(invalid(
                    &id,
                    format!("script file not found: {}", path.display()),
                ));
            }
            ScriptRef::File(path)
        }
        (None, Some(lines)) => ScriptRef::Inline(lines),
    };

    validate_expected(&id, &entry.expected)?;

    Ok(VerificationCase {
        id,
        description: entry.description,
        script,
        expected: entry.expected,
    })
}

fn validate_expected(case_id: &str, expected: &[ExpectedValue]) -> Result<(), CatalogError> {
    if expected.is_empty() {
        return Err(invalid(case_id, "case declares no expected values"));
    }
    let mut seen = BTreeSet::new();
    for value in expected {
        validate_label(&value.label).map_err(|message| invalid(case_id, message))?;
        if !seen.insert(value.label.to_ascii_uppercase()) {
            return Err(invalid(
                case_id,
                format!("duplicate label {:?}", value.label),
            ));
        }
        if !value.target.is_finite() {
            return Err(invalid(
                case_id,
                format!("label {:?} target must be finite", value.label),
            ));
        }
        value
            .tolerance
            .validate()
            .map_err(|message| invalid(case_id, format!("label {:?}: {message}", value.label)))?;
    }
    Ok(())
}

/// Labels are queried as engine parameters, so they follow parameter naming.
pub fn validate_label(label: &str) -> Result<(), String> {
    let Some(first) = label.chars().next() else {
        return Err("label must be non-empty".to_string());
    };
    if !first.is_ascii_alphabetic() {
        return Err(format!("label {label:?} must start with a letter"));
    }
    if label.len() > MAX_LABEL_LEN {
        return Err(format!(
            "label {label:?} exceeds {MAX_LABEL_LEN} characters"
        ));
    }
    if !label
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
    {
        return Err(format!(
            "label {label:?} may only contain letters, digits, and underscores"
        ));
    }
    Ok(())
}

#[cfg(test)]
#[path = "catalog_tests.rs"]
mod tests;
