//! Engine sessions backed by a local child process.
//!
//! Commands are written one per line to the child's stdin. The reply to each
//! command is every stdout line up to a line equal to the ready marker; a
//! line starting with the fault marker turns the reply into a fault.
use super::{Engine, EngineSession, SessionError, TraceChunk};
use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

/// Grace period for a child to exit after the exit command before it is killed.
const EXIT_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct ProcessEngineConfig {
    /// Command line, split with shell-words.
    pub command: String,
    pub ready_marker: String,
    pub fault_marker: String,
    pub open_timeout: Duration,
    pub exit_command: String,
    pub ping_command: String,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug)]
pub struct ProcessEngine {
    argv: Vec<String>,
    config: ProcessEngineConfig,
}

impl ProcessEngine {
    /// Markers are matched against trimmed output lines, so they are trimmed
    /// here as well.
    pub fn new(mut config: ProcessEngineConfig) -> Result<Self> {
        config.ready_marker = config.ready_marker.trim().to_string();
        config.fault_marker = config.fault_marker.trim().to_string();
        if config.ready_marker.is_empty() || config.fault_marker.is_empty() {
            return Err(anyhow!("engine ready and fault markers must be non-empty"));
        }
        let argv = shell_words::split(&config.command)
            .with_context(|| format!("parse engine command: {}", config.command))?;
        if argv.is_empty() {
            return Err(anyhow!("engine command is empty"));
        }
        Ok(Self { argv, config })
    }
}

impl Engine for ProcessEngine {
    fn open_session(&self) -> Result<Box<dyn EngineSession>, SessionError> {
        let start = Instant::now();
        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }
        let mut child = cmd
            .spawn()
            .map_err(|err| SessionError::Io(format!("spawn {}: {err}", self.argv[0])))?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SessionError::Io("engine pipes unavailable".to_string()));
            }
        };

        let (tx, rx) = mpsc::channel();
        let reader = thread::Builder::new()
            .name("engine-stdout".to_string())
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else {
                        break;
                    };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
        if let Err(err) = reader {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SessionError::Io(format!("spawn stdout reader: {err}")));
        }

        let mut session = ProcessSession {
            child,
            stdin: Some(stdin),
            lines: rx,
            ready_marker: self.config.ready_marker.clone(),
            fault_marker: self.config.fault_marker.clone(),
            exit_command: self.config.exit_command.clone(),
            ping_command: self.config.ping_command.clone(),
            closed: false,
        };
        // The banner runs up to the first ready marker.
        if let Err(err) = session.read_reply(self.config.open_timeout) {
            session.close();
            return Err(err);
        }
        tracing::debug!(
            elapsed_ms = start.elapsed().as_millis(),
            pid = session.child.id(),
            "engine session opened"
        );
        Ok(Box::new(session))
    }

    fn describe(&self) -> String {
        format!("process:{}", self.config.command)
    }
}

struct ProcessSession {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Receiver<String>,
    ready_marker: String,
    fault_marker: String,
    exit_command: String,
    ping_command: String,
    closed: bool,
}

impl ProcessSession {
    fn write_line(&mut self, command: &str) -> Result<(), SessionError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| SessionError::Closed("stdin already closed".to_string()))?;
        let result = stdin
            .write_all(command.as_bytes())
            .and_then(|()| stdin.write_all(b"\n"))
            .and_then(|()| stdin.flush());
        result.map_err(|err| match err.kind() {
            ErrorKind::BrokenPipe => SessionError::Closed("engine stdin closed".to_string()),
            _ => SessionError::Io(format!("write command: {err}")),
        })
    }

    fn read_reply(&mut self, timeout: Duration) -> Result<Vec<String>, SessionError> {
        let deadline = Instant::now() + timeout;
        let mut lines = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.lines.recv_timeout(remaining) {
                Ok(line) => {
                    let line = line.trim_end_matches('\r').to_string();
                    if line.trim() == self.ready_marker {
                        return Ok(lines);
                    }
                    lines.push(line);
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(SessionError::Timeout(timeout));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    let status = self
                        .child
                        .try_wait()
                        .ok()
                        .flatten()
                        .map(|status| status.to_string())
                        .unwrap_or_else(|| "stdout closed".to_string());
                    return Err(SessionError::Closed(format!("engine exited ({status})")));
                }
            }
        }
    }
}

impl EngineSession for ProcessSession {
    fn send(&mut self, command: &str, timeout: Duration) -> Result<TraceChunk, SessionError> {
        if self.closed {
            return Err(SessionError::Closed("session already closed".to_string()));
        }
        self.write_line(command)?;
        let lines = self.read_reply(timeout)?;
        if lines
            .iter()
            .any(|line| line.trim_start().starts_with(&self.fault_marker))
        {
            return Err(SessionError::Fault(lines.join("\n")));
        }
        Ok(TraceChunk::new(command, lines))
    }

    fn ping(&mut self, timeout: Duration) -> bool {
        if self.closed {
            return false;
        }
        if matches!(self.child.try_wait(), Ok(Some(_)) | Err(_)) {
            return false;
        }
        let ping = self.ping_command.clone();
        self.send(&ping, timeout).is_ok()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let exit = self.exit_command.clone();
        let _ = self.write_line(&exit);
        self.stdin = None;

        let deadline = Instant::now() + EXIT_GRACE;
        while Instant::now() < deadline {
            if matches!(self.child.try_wait(), Ok(Some(_))) {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        self.close();
    }
}
