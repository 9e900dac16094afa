//! Narrow capability over the external analysis engine.
//!
//! The harness never assumes anything about solver internals: it can open a
//! session, send one command at a time and read back the reply, check
//! liveness, and close the session. Transports live in submodules.
mod http;
mod mock;
mod process;

pub use http::{HttpEngine, HttpEngineConfig};
pub use mock::{MockEngine, MockEngineBuilder, MockInterpreter, MockStats, MockStep};
pub use process::{ProcessEngine, ProcessEngineConfig};

use std::time::Duration;
use thiserror::Error;

/// Transport-level failure reported by a session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The engine signaled a fault while processing the command.
    #[error("engine fault: {0}")]
    Fault(String),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    /// The session is gone (process exited, remote session dropped).
    #[error("session closed: {0}")]
    Closed(String),
    #[error("session i/o: {0}")]
    Io(String),
}

/// Output produced by the engine in reply to one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceChunk {
    pub command: String,
    pub lines: Vec<String>,
}

impl TraceChunk {
    pub fn new(command: impl Into<String>, lines: Vec<String>) -> Self {
        Self {
            command: command.into(),
            lines,
        }
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

/// One live engine session. Owned by exactly one case execution at a time.
pub trait EngineSession: Send {
    /// Send a single command and wait up to `timeout` for its reply.
    fn send(&mut self, command: &str, timeout: Duration) -> Result<TraceChunk, SessionError>;

    /// Cheap liveness check.
    fn ping(&mut self, timeout: Duration) -> bool;

    /// Tear the session down. Must be safe to call more than once.
    fn close(&mut self);
}

/// Factory for engine sessions.
pub trait Engine: Send + Sync {
    fn open_session(&self) -> Result<Box<dyn EngineSession>, SessionError>;

    /// Human-readable identity recorded in run reports.
    fn describe(&self) -> String;
}
