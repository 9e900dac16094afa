//! In-process engine double.
//!
//! `MockInterpreter` emulates the engine's parameter facilities closely
//! enough for the harness: assignments echo `PARAMETER NAME = value`,
//! `*STATUS,NAME` prints a status table, `*MSG,ERROR,...` raises a fault.
//! `MockEngine` wraps it with injectable failures and session counters; the
//! `vmh-mock-engine` binary wraps the same interpreter in the stdin/stdout
//! line protocol.
use super::{Engine, EngineSession, SessionError, TraceChunk};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

/// Fault prefix printed by the interpreter; matches the default fault marker.
pub const MOCK_FAULT_PREFIX: &str = "*** ERROR ***";

#[derive(Debug, Clone, PartialEq)]
enum MockParam {
    Scalar(f64),
    Text(String),
}

/// What the caller should do after interpreting one command.
#[derive(Debug, Clone, PartialEq)]
pub enum MockStep {
    Reply(Vec<String>),
    Wait(Duration, Vec<String>),
    Exit,
}

#[derive(Debug, Default, Clone)]
pub struct MockInterpreter {
    params: BTreeMap<String, MockParam>,
}

impl MockInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn banner() -> Vec<String> {
        vec![
            " MOCK ANALYSIS ENGINE  (harness test double)".to_string(),
            " PARAMETER FACILITIES: *SET  *STATUS  /COM  *MSG  /WAIT  /EXIT".to_string(),
        ]
    }

    #[cfg(test)]
    fn scalar(&self, name: &str) -> Option<f64> {
        match self.params.get(&name.to_ascii_uppercase()) {
            Some(MockParam::Scalar(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn execute(&mut self, command: &str) -> MockStep {
        let command = command.trim();
        if command.is_empty() {
            return MockStep::Reply(Vec::new());
        }
        let fields: Vec<&str> = command.split(',').map(str::trim).collect();
        let head = fields[0].to_ascii_uppercase();
        match head.as_str() {
            "/EXIT" => MockStep::Exit,
            "/COM" => {
                let text = command.split_once(',').map(|(_, rest)| rest).unwrap_or("");
                MockStep::Reply(vec![format!(" {text}")])
            }
            "/WAIT" => {
                let seconds = fields
                    .get(1)
                    .copied()
                    .and_then(parse_number)
                    .unwrap_or(0.0)
                    .max(0.0);
                MockStep::Wait(Duration::from_secs_f64(seconds), Vec::new())
            }
            "*MSG" => {
                let level = fields.get(1).map(|value| value.to_ascii_uppercase());
                let text = fields.get(2..).map(|rest| rest.join(",")).unwrap_or_default();
                match level.as_deref() {
                    Some("ERROR") => MockStep::Reply(vec![format!("{MOCK_FAULT_PREFIX} {text}")]),
                    Some(level) => MockStep::Reply(vec![format!(" *** {level} *** {text}")]),
                    None => MockStep::Reply(Vec::new()),
                }
            }
            "*SET" => {
                let name = fields.get(1).copied().unwrap_or("");
                let value = fields.get(2).copied().unwrap_or("");
                MockStep::Reply(self.assign(name, value))
            }
            "*STATUS" => MockStep::Reply(self.status(fields.get(1).copied())),
            _ => match command.split_once('=') {
                Some((name, value)) if is_param_name(name.trim()) => {
                    MockStep::Reply(self.assign(name.trim(), value))
                }
                _ => MockStep::Reply(Vec::new()),
            },
        }
    }

    fn assign(&mut self, name: &str, raw: &str) -> Vec<String> {
        if !is_param_name(name) {
            return vec![format!(" *** WARNING *** invalid parameter name {name:?}")];
        }
        let name = name.to_ascii_uppercase();
        let raw = raw.trim();
        let param = if let Some(text) = raw
            .strip_prefix('\'')
            .and_then(|rest| rest.strip_suffix('\''))
        {
            MockParam::Text(text.to_string())
        } else if let Some(value) = parse_number(raw) {
            MockParam::Scalar(value)
        } else if let Some(existing) = self.params.get(&raw.to_ascii_uppercase()) {
            existing.clone()
        } else {
            return vec![format!(" *** WARNING *** cannot evaluate {raw:?} for {name}")];
        };
        let line = match &param {
            MockParam::Scalar(value) => format!(" PARAMETER {name} =     {value:.8}"),
            MockParam::Text(text) => format!(" PARAMETER {name} = '{text}'"),
        };
        self.params.insert(name, param);
        vec![line]
    }

    fn status(&self, name: Option<&str>) -> Vec<String> {
        let mut lines = vec![
            format!(
                " PARAMETER STATUS- ( {} PARAMETERS DEFINED)",
                self.params.len()
            ),
            String::new(),
            " NAME                              VALUE                        TYPE  DIMENSIONS"
                .to_string(),
        ];
        let selected: Vec<(&String, &MockParam)> = match name.filter(|n| !n.is_empty()) {
            Some(name) => {
                let key = name.to_ascii_uppercase();
                match self.params.get_key_value(&key) {
                    Some(entry) => vec![entry],
                    None => {
                        lines.push(format!(" *** NOTE *** parameter {key} is not defined"));
                        return lines;
                    }
                }
            }
            None => self.params.iter().collect(),
        };
        for (key, param) in selected {
            lines.push(match param {
                MockParam::Scalar(value) => format!(" {key:<32} {value:>20.10}   SCALAR"),
                MockParam::Text(text) => format!(" {key:<32} {text:<20}   CHARACTER"),
            });
        }
        lines
    }
}

fn is_param_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(first) if first.is_ascii_alphabetic())
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.trim()
        .replace(['D', 'd'], "E")
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

#[derive(Debug)]
struct FaultRule {
    pattern: String,
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct MockBehavior {
    latency: Duration,
    open_latency: Duration,
    command_latency: Vec<(String, Duration)>,
    faults: Mutex<Vec<FaultRule>>,
    overrides: Vec<(String, Vec<String>)>,
    open_failures: Mutex<Option<usize>>,
    ping_failures: Mutex<Option<usize>>,
}

#[derive(Debug, Default)]
struct MockCounters {
    open_attempts: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
    live: AtomicUsize,
    peak_live: AtomicUsize,
    commands: AtomicUsize,
    pings: AtomicUsize,
}

/// Snapshot of session accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MockStats {
    pub open_attempts: usize,
    pub opened: usize,
    pub closed: usize,
    pub live: usize,
    pub peak_live: usize,
    pub commands: usize,
    pub pings: usize,
}

#[derive(Debug, Default)]
pub struct MockEngineBuilder {
    behavior: MockBehavior,
}

impl MockEngineBuilder {
    /// Delay applied to every command.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.behavior.latency = latency;
        self
    }

    /// Delay applied to every session open, successful or not.
    pub fn open_latency(mut self, latency: Duration) -> Self {
        self.behavior.open_latency = latency;
        self
    }

    /// Extra delay for commands containing `pattern` (case-insensitive).
    pub fn command_latency(mut self, pattern: &str, latency: Duration) -> Self {
        self.behavior
            .command_latency
            .push((pattern.to_ascii_uppercase(), latency));
        self
    }

    /// Fault every command containing `pattern`.
    pub fn fault_on(self, pattern: &str) -> Self {
        self.push_fault(pattern, None)
    }

    /// Fault the first `times` commands containing `pattern`, across sessions.
    pub fn fault_on_first(self, pattern: &str, times: usize) -> Self {
        self.push_fault(pattern, Some(times))
    }

    fn push_fault(self, pattern: &str, remaining: Option<usize>) -> Self {
        self.behavior
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(FaultRule {
                pattern: pattern.to_ascii_uppercase(),
                remaining,
            });
        self
    }

    /// Replace the reply to an exact command (case-insensitive).
    pub fn reply_override(mut self, command: &str, lines: &[&str]) -> Self {
        self.behavior.overrides.push((
            command.trim().to_ascii_uppercase(),
            lines.iter().map(|line| line.to_string()).collect(),
        ));
        self
    }

    /// Fail the first `times` session opens.
    pub fn fail_opens(mut self, times: usize) -> Self {
        self.behavior.open_failures = Mutex::new(Some(times));
        self
    }

    /// Fail every session open.
    pub fn refuse_opens(mut self) -> Self {
        self.behavior.open_failures = Mutex::new(Some(usize::MAX));
        self
    }

    /// Fail the first `times` liveness checks.
    pub fn fail_pings(mut self, times: usize) -> Self {
        self.behavior.ping_failures = Mutex::new(Some(times));
        self
    }

    pub fn build(self) -> MockEngine {
        MockEngine {
            behavior: Arc::new(self.behavior),
            counters: Arc::new(MockCounters::default()),
        }
    }
}

/// Shared-state engine double; clones observe the same counters.
#[derive(Debug, Clone)]
pub struct MockEngine {
    behavior: Arc<MockBehavior>,
    counters: Arc<MockCounters>,
}

impl Default for MockEngine {
    fn default() -> Self {
        MockEngineBuilder::default().build()
    }
}

impl MockEngine {
    pub fn builder() -> MockEngineBuilder {
        MockEngineBuilder::default()
    }

    pub fn stats(&self) -> MockStats {
        let counters = &self.counters;
        MockStats {
            open_attempts: counters.open_attempts.load(Ordering::SeqCst),
            opened: counters.opened.load(Ordering::SeqCst),
            closed: counters.closed.load(Ordering::SeqCst),
            live: counters.live.load(Ordering::SeqCst),
            peak_live: counters.peak_live.load(Ordering::SeqCst),
            commands: counters.commands.load(Ordering::SeqCst),
            pings: counters.pings.load(Ordering::SeqCst),
        }
    }
}

/// Consume one unit of a countdown; `Some(usize::MAX)` never runs out.
fn take_injection(slot: &Mutex<Option<usize>>) -> bool {
    let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
    match guard.as_mut() {
        Some(remaining) if *remaining == usize::MAX => true,
        Some(remaining) if *remaining > 0 => {
            *remaining -= 1;
            true
        }
        _ => false,
    }
}

impl Engine for MockEngine {
    fn open_session(&self) -> Result<Box<dyn EngineSession>, SessionError> {
        self.counters.open_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.behavior.open_latency.is_zero() {
            thread::sleep(self.behavior.open_latency);
        }
        if take_injection(&self.behavior.open_failures) {
            return Err(SessionError::Io("injected open failure".to_string()));
        }
        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak_live.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            interpreter: MockInterpreter::new(),
            behavior: Arc::clone(&self.behavior),
            counters: Arc::clone(&self.counters),
            closed: false,
        }))
    }

    fn describe(&self) -> String {
        "mock".to_string()
    }
}

struct MockSession {
    interpreter: MockInterpreter,
    behavior: Arc<MockBehavior>,
    counters: Arc<MockCounters>,
    closed: bool,
}

impl MockSession {
    fn delay_for(&self, upper: &str) -> Duration {
        let extra: Duration = self
            .behavior
            .command_latency
            .iter()
            .filter(|(pattern, _)| upper.contains(pattern.as_str()))
            .map(|(_, latency)| *latency)
            .sum();
        self.behavior.latency + extra
    }

    fn injected_fault(&self, upper: &str) -> bool {
        let mut faults = self
            .behavior
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for rule in faults.iter_mut() {
            if !upper.contains(rule.pattern.as_str()) {
                continue;
            }
            match rule.remaining.as_mut() {
                None => return true,
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    return true;
                }
                Some(_) => {}
            }
        }
        false
    }
}

/// Sleep for `wanted`, but never past `timeout`; true if the budget ran out.
fn bounded_sleep(wanted: Duration, timeout: Duration) -> bool {
    if wanted > timeout {
        thread::sleep(timeout);
        return true;
    }
    if !wanted.is_zero() {
        thread::sleep(wanted);
    }
    false
}

impl EngineSession for MockSession {
    fn send(&mut self, command: &str, timeout: Duration) -> Result<TraceChunk, SessionError> {
        if self.closed {
            return Err(SessionError::Closed("session already closed".to_string()));
        }
        self.counters.commands.fetch_add(1, Ordering::SeqCst);
        let upper = command.trim().to_ascii_uppercase();

        let mut waited = self.delay_for(&upper);
        if bounded_sleep(waited, timeout) {
            return Err(SessionError::Timeout(timeout));
        }
        if self.injected_fault(&upper) {
            return Err(SessionError::Fault(format!(
                "{MOCK_FAULT_PREFIX} injected fault in {command}"
            )));
        }
        if let Some((_, lines)) = self
            .behavior
            .overrides
            .iter()
            .find(|(pattern, _)| *pattern == upper)
        {
            return Ok(TraceChunk::new(command, lines.clone()));
        }

        let lines = match self.interpreter.execute(command) {
            MockStep::Reply(lines) => lines,
            MockStep::Wait(duration, lines) => {
                let remaining = timeout.saturating_sub(waited);
                waited += duration;
                if bounded_sleep(duration, remaining) {
                    return Err(SessionError::Timeout(timeout));
                }
                lines
            }
            MockStep::Exit => {
                self.close();
                Vec::new()
            }
        };
        if lines
            .iter()
            .any(|line| line.trim_start().starts_with(MOCK_FAULT_PREFIX))
        {
            return Err(SessionError::Fault(lines.join("\n")));
        }
        tracing::trace!(command, waited_ms = waited.as_millis(), "mock command");
        Ok(TraceChunk::new(command, lines))
    }

    fn ping(&mut self, _timeout: Duration) -> bool {
        self.counters.pings.fetch_add(1, Ordering::SeqCst);
        !self.closed && !take_injection(&self.behavior.ping_failures)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.counters.closed.fetch_add(1, Ordering::SeqCst);
        self.counters.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.close();
    }
}
