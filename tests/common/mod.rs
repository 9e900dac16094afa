//! Shared test infrastructure for integration tests.
#![allow(dead_code)]

use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;
use vm_harness::catalog::{ExpectedValue, ScriptRef, VerificationCase};
use vm_harness::compare::Tolerance;

pub fn vmh_bin() -> &'static str {
    env!("CARGO_BIN_EXE_vmh")
}

pub fn mock_engine_bin() -> &'static str {
    env!("CARGO_BIN_EXE_vmh-mock-engine")
}

/// In-memory case with a 5% relative tolerance on every label.
pub fn inline_case(id: &str, script: &[&str], labels: &[(&str, f64)]) -> VerificationCase {
    VerificationCase {
        id: id.to_string(),
        description: None,
        script: ScriptRef::Inline(script.iter().map(|line| line.to_string()).collect()),
        expected: labels
            .iter()
            .map(|(label, target)| ExpectedValue {
                label: label.to_string(),
                unit: String::new(),
                target: *target,
                tolerance: Tolerance::relative(0.05),
            })
            .collect(),
    }
}

/// Temporary directory holding a catalog, scripts and a harness config that
/// drives the `vmh-mock-engine` binary.
pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("create tempdir"),
        }
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn write(&self, rel: &str, text: &str) -> PathBuf {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(&path, text).expect("write file");
        path
    }

    pub fn write_json(&self, rel: &str, value: &Value) -> PathBuf {
        self.write(
            rel,
            &serde_json::to_string_pretty(value).expect("serialize json"),
        )
    }

    /// Config for the mock engine binary with extra CLI arguments.
    pub fn write_config(&self, engine_args: &[&str]) -> PathBuf {
        let mut argv = vec![mock_engine_bin()];
        argv.extend_from_slice(engine_args);
        self.write_json(
            "config.json",
            &json!({
                "schema_version": 1,
                "engine": {
                    "kind": "process",
                    "command": shell_words::join(argv),
                    "open_timeout_ms": 5000
                },
                "pool": { "capacity": 2, "acquire_timeout_ms": 5000 },
                "execution": { "timeout_ms": 5000 },
                "retry": { "max_attempts": 2, "initial_backoff_ms": 10, "max_backoff_ms": 20 }
            }),
        )
    }

    /// Beam catalog: `beam-bend-1` computes `computed` against target 387.28.
    pub fn write_beam_catalog(&self, computed: f64) -> PathBuf {
        self.write(
            "scripts/beam.dat",
            &format!("! cantilever beam\n/COM,beam bending\nMAX_STRESS = {computed}\n"),
        );
        self.write_json(
            "catalog.json",
            &json!({
                "schema_version": 1,
                "cases": [
                    {
                        "id": "beam-bend-1",
                        "description": "cantilever beam bending stress",
                        "script": { "path": "scripts/beam.dat" },
                        "expected": [
                            { "label": "max_stress", "unit": "psi", "target": 387.28,
                              "tolerance": { "kind": "relative", "delta": 0.05 } }
                        ]
                    },
                    {
                        "id": "truss-2",
                        "script": { "inline": ["FORCE = 1000.0", "DEFL = -0.0125"] },
                        "expected": [
                            { "label": "force", "unit": "lbf", "target": 1000.0,
                              "tolerance": { "kind": "absolute", "epsilon": 0.5 } },
                            { "label": "defl", "unit": "in", "target": -0.0125,
                              "tolerance": { "kind": "ratio_range", "lower": 0.99, "upper": 1.01 } }
                        ]
                    }
                ]
            }),
        )
    }

    pub fn vmh(&self, args: &[&str]) -> Output {
        Command::new(vmh_bin())
            .args(args)
            .current_dir(self.dir.path())
            .env_remove("VMH_CONFIG")
            .env("RUST_LOG", "warn")
            .output()
            .expect("run vmh")
    }
}

pub fn read_json(path: &Path) -> Value {
    let text = fs::read_to_string(path).expect("read json");
    serde_json::from_str(&text).expect("parse json")
}

pub fn exit_code(output: &Output) -> i32 {
    output.status.code().unwrap_or(-1)
}

pub fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

pub fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}
