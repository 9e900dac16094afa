//! Per-case state machine.
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaseState {
    Pending,
    Acquiring,
    Running,
    Extracting,
    Comparing,
    Done,
    Failed,
}

impl CaseState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Acquiring => "ACQUIRING",
            Self::Running => "RUNNING",
            Self::Extracting => "EXTRACTING",
            Self::Comparing => "COMPARING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Retries re-enter `Acquiring` from `Acquiring` or `Running`.
    pub fn can_transition(self, next: Self) -> bool {
        use CaseState::*;
        matches!(
            (self, next),
            (Pending, Acquiring)
                | (Pending, Failed)
                | (Acquiring, Acquiring)
                | (Acquiring, Running)
                | (Acquiring, Failed)
                | (Running, Acquiring)
                | (Running, Extracting)
                | (Running, Failed)
                | (Extracting, Comparing)
                | (Extracting, Failed)
                | (Comparing, Done)
        )
    }
}

impl fmt::Display for CaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    PoolExhausted,
    EngineError,
    Timeout,
    Disconnected,
    UnexpectedShape,
    /// The case script could not be read.
    Script,
    Aborted,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PoolExhausted => "pool_exhausted",
            Self::EngineError => "engine_error",
            Self::Timeout => "timeout",
            Self::Disconnected => "disconnected",
            Self::UnexpectedShape => "unexpected_shape",
            Self::Script => "script",
            Self::Aborted => "aborted",
        }
    }
}

/// Why and where a case entered `FAILED`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseFailure {
    pub stage: CaseState,
    pub kind: FailureKind,
    pub message: String,
}

/// Tracks one case through its states, logging each transition.
#[derive(Debug)]
pub struct CaseMachine {
    case_id: String,
    state: CaseState,
}

impl CaseMachine {
    pub fn new(case_id: &str) -> Self {
        Self {
            case_id: case_id.to_string(),
            state: CaseState::Pending,
        }
    }

    pub fn state(&self) -> CaseState {
        self.state
    }

    pub fn advance(&mut self, next: CaseState) {
        debug_assert!(
            self.state.can_transition(next),
            "illegal transition {} -> {} for {}",
            self.state,
            next,
            self.case_id
        );
        tracing::debug!(case_id = %self.case_id, from = %self.state, to = %next, "case transition");
        self.state = next;
    }

    /// Enter `FAILED`, returning the failure record stamped with the stage.
    pub fn fail(&mut self, kind: FailureKind, message: impl Into<String>) -> CaseFailure {
        let failure = CaseFailure {
            stage: self.state,
            kind,
            message: message.into(),
        };
        self.advance(CaseState::Failed);
        failure
    }
}
