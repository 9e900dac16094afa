//! Transport-and-capture layer: streams a script to a leased session.
use crate::catalog::Script;
use crate::engine::{SessionError, TraceChunk};
use crate::pool::SessionLease;
use crate::util::duration_ms;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RunError {
    /// Solver-signaled fault, carrying the engine's raw text.
    #[error("engine error: {0}")]
    Engine(String),
    #[error("script exceeded execution budget after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u64 },
    #[error("engine session lost: {0}")]
    Disconnected(String),
}

impl RunError {
    /// Timeouts are terminal for the case; everything else may be retried.
    pub fn is_transient(&self) -> bool {
        !matches!(self, RunError::Timeout { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RunError::Engine(_) => "engine_error",
            RunError::Timeout { .. } => "timeout",
            RunError::Disconnected(_) => "disconnected",
        }
    }
}

/// Raw output of one script run, in send order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionTrace {
    chunks: Vec<TraceChunk>,
    completed: bool,
}

impl ExecutionTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: TraceChunk) {
        self.chunks.push(chunk);
    }

    pub fn mark_completed(&mut self) {
        self.completed = true;
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn chunks(&self) -> &[TraceChunk] {
        &self.chunks
    }

    /// Reply to the last occurrence of `command`.
    pub fn reply_to(&self, command: &str) -> Option<&TraceChunk> {
        self.chunks
            .iter()
            .rev()
            .find(|chunk| chunk.command.trim().eq_ignore_ascii_case(command.trim()))
    }

    pub fn line_count(&self) -> usize {
        self.chunks.iter().map(|chunk| chunk.lines.len()).sum()
    }
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Execution budget for the whole script, end sentinel included.
    pub timeout: Duration,
    pub end_command: String,
    pub end_marker: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            end_command: "/COM,HARNESS_END_OF_SCRIPT".to_string(),
            end_marker: "HARNESS_END_OF_SCRIPT".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScriptRunner {
    config: RunnerConfig,
}

impl ScriptRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Send every command, then the end-of-script sentinel. On timeout or a
    /// lost session the lease is marked unhealthy so the pool evicts it.
    pub fn run(
        &self,
        lease: &mut SessionLease<'_>,
        script: &Script,
    ) -> Result<ExecutionTrace, RunError> {
        let start = Instant::now();
        let deadline = start + self.config.timeout;
        let mut trace = ExecutionTrace::new();

        for command in &script.commands {
            let chunk = self.send(lease, command, deadline, start)?;
            trace.push(chunk);
        }

        let end = self.send(lease, &self.config.end_command, deadline, start)?;
        let sentinel_seen = end
            .lines
            .iter()
            .any(|line| line.contains(&self.config.end_marker));
        trace.push(end);
        if !sentinel_seen {
            lease.mark_unhealthy();
            return Err(RunError::Engine(format!(
                "end-of-script marker {:?} not echoed",
                self.config.end_marker
            )));
        }
        trace.mark_completed();

        tracing::debug!(
            session_id = lease.id(),
            commands = script.len(),
            lines = trace.line_count(),
            elapsed_ms = start.elapsed().as_millis(),
            "script complete"
        );
        Ok(trace)
    }

    fn send(
        &self,
        lease: &mut SessionLease<'_>,
        command: &str,
        deadline: Instant,
        start: Instant,
    ) -> Result<TraceChunk, RunError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            lease.mark_unhealthy();
            return Err(RunError::Timeout {
                elapsed_ms: duration_ms(start.elapsed()),
            });
        }
        lease.send(command, remaining).map_err(|err| {
            // A session that faulted, stalled or vanished is in an unknown state.
            lease.mark_unhealthy();
            match err {
                SessionError::Fault(text) => RunError::Engine(text),
                SessionError::Timeout(_) => RunError::Timeout {
                    elapsed_ms: duration_ms(start.elapsed()),
                },
                SessionError::Closed(reason) | SessionError::Io(reason) => {
                    RunError::Disconnected(reason)
                }
            }
        })
    }
}
