//! Harness configuration.
//!
//! One JSON document selects the engine transport and tunes the pool, the
//! runner and the retry policy. Every section is optional and defaulted;
//! unknown fields are rejected so typos surface at load time.
use crate::engine::{
    Engine, HttpEngine, HttpEngineConfig, ProcessEngine, ProcessEngineConfig,
};
use crate::extract::LABEL_PLACEHOLDER;
use crate::orchestrator::retry::RetryPolicy;
use crate::pool::PoolConfig;
use crate::runner::RunnerConfig;
use crate::util::{read_json, write_text_atomic};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const CONFIG_SCHEMA_VERSION: u32 = 1;
pub const CONFIG_ENV: &str = "VMH_CONFIG";
const CONFIG_DIR_NAME: &str = "vm-harness";
const CONFIG_FILE_NAME: &str = "config.json";

fn default_ready_marker() -> String {
    "%%READY%%".to_string()
}

fn default_fault_marker() -> String {
    "*** ERROR ***".to_string()
}

fn default_open_timeout_ms() -> u64 {
    10_000
}

fn default_exit_command() -> String {
    "/EXIT".to_string()
}

fn default_ping_command() -> String {
    "/COM,HARNESS_PING".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum EngineSection {
    Process {
        command: String,
        #[serde(default = "default_ready_marker")]
        ready_marker: String,
        #[serde(default = "default_fault_marker")]
        fault_marker: String,
        #[serde(default = "default_open_timeout_ms")]
        open_timeout_ms: u64,
        #[serde(default = "default_exit_command")]
        exit_command: String,
        #[serde(default = "default_ping_command")]
        ping_command: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
    Http {
        base_url: String,
        #[serde(default = "default_request_timeout_ms")]
        request_timeout_ms: u64,
    },
}

impl Default for EngineSection {
    fn default() -> Self {
        Self::Process {
            command: "vmh-mock-engine".to_string(),
            ready_marker: default_ready_marker(),
            fault_marker: default_fault_marker(),
            open_timeout_ms: default_open_timeout_ms(),
            exit_command: default_exit_command(),
            ping_command: default_ping_command(),
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSection {
    pub capacity: usize,
    pub acquire_timeout_ms: u64,
    pub max_substitutions: usize,
    pub ping_timeout_ms: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            capacity: 2,
            acquire_timeout_ms: 60_000,
            max_substitutions: 2,
            ping_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionSection {
    pub timeout_ms: u64,
    pub end_command: String,
    pub end_marker: String,
    pub query_template: String,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            timeout_ms: 600_000,
            end_command: "/COM,HARNESS_END_OF_SCRIPT".to_string(),
            end_marker: "HARNESS_END_OF_SCRIPT".to_string(),
            query_template: "*STATUS,{label}".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            multiplier: 2.0,
            max_backoff_ms: 8_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    pub schema_version: u32,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub execution: ExecutionSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub fail_fast: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            engine: EngineSection::default(),
            pool: PoolSection::default(),
            execution: ExecutionSection::default(),
            retry: RetrySection::default(),
            fail_fast: false,
        }
    }
}

impl HarnessConfig {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            capacity: self.pool.capacity,
            acquire_timeout: Duration::from_millis(self.pool.acquire_timeout_ms),
            max_substitutions: self.pool.max_substitutions,
            ping_timeout: Duration::from_millis(self.pool.ping_timeout_ms),
        }
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            timeout: Duration::from_millis(self.execution.timeout_ms),
            end_command: self.execution.end_command.clone(),
            end_marker: self.execution.end_marker.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            multiplier: self.retry.multiplier,
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
        }
    }

    /// Construct the configured engine transport.
    pub fn build_engine(&self) -> Result<Arc<dyn Engine>> {
        match &self.engine {
            EngineSection::Process {
                command,
                ready_marker,
                fault_marker,
                open_timeout_ms,
                exit_command,
                ping_command,
                env,
            } => {
                let engine = ProcessEngine::new(ProcessEngineConfig {
                    command: command.clone(),
                    ready_marker: ready_marker.clone(),
                    fault_marker: fault_marker.clone(),
                    open_timeout: Duration::from_millis(*open_timeout_ms),
                    exit_command: exit_command.clone(),
                    ping_command: ping_command.clone(),
                    env: env.clone(),
                })?;
                Ok(Arc::new(engine))
            }
            EngineSection::Http {
                base_url,
                request_timeout_ms,
            } => Ok(Arc::new(HttpEngine::new(HttpEngineConfig {
                base_url: base_url.clone(),
                request_timeout: Duration::from_millis(*request_timeout_ms),
            }))),
        }
    }
}

/// Render the default config as pretty JSON.
pub fn config_stub() -> Result<String> {
    serde_json::to_string_pretty(&HarnessConfig::default()).context("serialize config stub")
}

/// Validate schema version and value ranges.
pub fn validate_config(config: &HarnessConfig) -> Result<()> {
    if config.schema_version != CONFIG_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported config schema_version {} (expected {CONFIG_SCHEMA_VERSION})",
            config.schema_version
        ));
    }
    match &config.engine {
        EngineSection::Process {
            command,
            ready_marker,
            fault_marker,
            ..
        } => {
            let argv = shell_words::split(command)
                .with_context(|| format!("parse engine command: {command}"))?;
            let Some(program) = argv.first() else {
                return Err(anyhow!("engine.command must be non-empty"));
            };
            which::which(program)
                .with_context(|| format!("engine executable {program:?} not found on PATH"))?;
            if ready_marker.trim().is_empty() || fault_marker.trim().is_empty() {
                return Err(anyhow!("engine ready_marker and fault_marker must be non-empty"));
            }
            if ready_marker.trim() == fault_marker.trim() {
                return Err(anyhow!("engine ready_marker and fault_marker must differ"));
            }
        }
        EngineSection::Http { base_url, .. } => {
            if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
                return Err(anyhow!(
                    "engine.base_url must be an http(s) URL (got {base_url:?})"
                ));
            }
        }
    }
    if config.pool.capacity == 0 {
        return Err(anyhow!("pool.capacity must be at least 1"));
    }
    if !config.execution.query_template.contains(LABEL_PLACEHOLDER) {
        return Err(anyhow!(
            "execution.query_template must contain {LABEL_PLACEHOLDER} (got {:?})",
            config.execution.query_template
        ));
    }
    if config.execution.end_marker.trim().is_empty() {
        return Err(anyhow!("execution.end_marker must be non-empty"));
    }
    if config.retry.max_attempts == 0 {
        return Err(anyhow!("retry.max_attempts must be at least 1"));
    }
    if !config.retry.multiplier.is_finite() || config.retry.multiplier < 1.0 {
        return Err(anyhow!(
            "retry.multiplier must be >= 1.0 (got {})",
            config.retry.multiplier
        ));
    }
    Ok(())
}

/// Load and validate a config file.
pub fn load_config(path: &Path) -> Result<HarnessConfig> {
    let config: HarnessConfig =
        read_json(path).with_context(|| format!("load config {}", path.display()))?;
    validate_config(&config).with_context(|| format!("invalid config {}", path.display()))?;
    Ok(config)
}

/// Path of the per-user config file, if a config dir exists.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// Pick the config file: explicit flag, then `VMH_CONFIG`, then the user
/// config file if it exists.
pub fn resolve_config_path(
    flag: Option<&Path>,
    env_value: Option<OsString>,
    user_path: Option<PathBuf>,
) -> Option<PathBuf> {
    if let Some(path) = flag {
        return Some(path.to_path_buf());
    }
    if let Some(value) = env_value.filter(|value| !value.is_empty()) {
        return Some(PathBuf::from(value));
    }
    user_path.filter(|path| path.is_file())
}

/// Resolve and load the effective config; built-in defaults when no file is
/// found. Defaults are validated too, so a missing engine binary surfaces here.
pub fn load_effective(flag: Option<&Path>) -> Result<(HarnessConfig, Option<PathBuf>)> {
    let path = resolve_config_path(flag, std::env::var_os(CONFIG_ENV), user_config_path());
    match path {
        Some(path) => {
            let config = load_config(&path)?;
            tracing::debug!(path = %path.display(), "loaded config");
            Ok((config, Some(path)))
        }
        None => {
            let config = HarnessConfig::default();
            validate_config(&config).context("invalid built-in default config")?;
            Ok((config, None))
        }
    }
}

/// Write the default config stub, refusing to overwrite unless `force`.
pub fn write_default_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(anyhow!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ));
    }
    let mut text = config_stub()?;
    text.push('\n');
    write_text_atomic(path, &text)
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
