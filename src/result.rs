//! Execution result model
//!
//! `ExecutionResult` is the terminal payload of every invocation. It is a sum
//! type so a run is either a `Success` or a `Failure`, never both.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Placeholder result value when a program printed nothing
pub const NO_OUTPUT: &str = "(no output)";

/// Note attached to results produced by the fallback interpreter
pub const DEGRADED_NOTE: &str =
    "executed via fallback interpreter; some language features unsupported";

/// Note attached to remote runs cut off by the service time limit
pub const KILLED_NOTE: &str = "execution was terminated after exceeding the time limit";

/// Channel a console line or output chunk was written to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamTag {
    Log,
    Info,
    Warn,
    Error,
    Debug,
    Stdout,
    Stderr,
}

impl fmt::Display for StreamTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamTag::Log => "log",
            StreamTag::Info => "info",
            StreamTag::Warn => "warn",
            StreamTag::Error => "error",
            StreamTag::Debug => "debug",
            StreamTag::Stdout => "stdout",
            StreamTag::Stderr => "stderr",
        };
        write!(f, "{}", s)
    }
}

/// A single captured console line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleLine {
    pub stream: StreamTag,
    pub text: String,
}

impl ConsoleLine {
    pub fn new(stream: StreamTag, text: impl Into<String>) -> Self {
        Self {
            stream,
            text: text.into(),
        }
    }
}

/// Split process stderr into console lines, one per line of text
pub fn stderr_lines(stderr: &str) -> Vec<ConsoleLine> {
    stderr
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| ConsoleLine::new(StreamTag::Stderr, line))
        .collect()
}

/// Marker appended once captured output hits the byte cap
pub const OUTPUT_TRUNCATED: &str = "[output truncated]";

/// Byte cap shared by every chunk of output captured for one run
#[derive(Debug, Clone)]
pub struct OutputBudget {
    remaining: usize,
    truncated: bool,
}

impl OutputBudget {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            remaining: max_bytes,
            truncated: false,
        }
    }

    /// Admit as much of `text` as still fits.
    ///
    /// Returns the admitted prefix (cut on a char boundary) and whether this
    /// call used up the budget. Once truncated, nothing else is admitted.
    pub fn admit<'a>(&mut self, text: &'a str) -> (&'a str, bool) {
        if self.truncated {
            return ("", false);
        }
        if text.len() <= self.remaining {
            self.remaining -= text.len();
            return (text, false);
        }

        let mut cut = self.remaining;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        self.remaining = 0;
        self.truncated = true;
        (&text[..cut], true)
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }
}

/// Stage at which a run failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Compile,
    Runtime,
    Transport,
    UnsupportedLanguage,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Compile => "compile",
            Phase::Runtime => "runtime",
            Phase::Transport => "transport",
            Phase::UnsupportedLanguage => "unsupported_language",
        };
        write!(f, "{}", s)
    }
}

/// Payload of a successful (or killed-but-qualified) run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Success {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_value: Option<String>,
    pub console_lines: Vec<ConsoleLine>,
    pub execution_time_ms: u64,
    /// Degraded-capability or time-limit annotation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Run was cut off by an external time limit; output is partial
    #[serde(default)]
    pub killed: bool,
}

/// Payload of a failed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    pub error_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub phase: Phase,
    #[serde(default)]
    pub killed: bool,
    pub execution_time_ms: u64,
    /// Console output gathered before the failure
    #[serde(default)]
    pub console_lines: Vec<ConsoleLine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Failure {
    pub fn new(phase: Phase, error_message: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            error_message: error_message.into(),
            error_detail: None,
            phase,
            killed: false,
            execution_time_ms,
            console_lines: Vec::new(),
            note: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.error_detail = Some(detail.into());
        self
    }

    pub fn with_console(mut self, lines: Vec<ConsoleLine>) -> Self {
        self.console_lines = lines;
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn killed(mut self) -> Self {
        self.killed = true;
        self
    }
}

/// Terminal payload of one invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionResult {
    Success(Success),
    Failure(Failure),
}

impl ExecutionResult {
    /// Rejection produced by the dispatcher before any executor runs
    pub fn unsupported(message: impl Into<String>) -> Self {
        ExecutionResult::Failure(Failure::new(Phase::UnsupportedLanguage, message, 0))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success(_))
    }

    pub fn is_killed(&self) -> bool {
        match self {
            ExecutionResult::Success(s) => s.killed,
            ExecutionResult::Failure(f) => f.killed,
        }
    }

    pub fn phase(&self) -> Option<Phase> {
        match self {
            ExecutionResult::Success(_) => None,
            ExecutionResult::Failure(f) => Some(f.phase),
        }
    }

    pub fn execution_time_ms(&self) -> u64 {
        match self {
            ExecutionResult::Success(s) => s.execution_time_ms,
            ExecutionResult::Failure(f) => f.execution_time_ms,
        }
    }

    pub fn console_lines(&self) -> &[ConsoleLine] {
        match self {
            ExecutionResult::Success(s) => &s.console_lines,
            ExecutionResult::Failure(f) => &f.console_lines,
        }
    }

    pub fn note(&self) -> Option<&str> {
        match self {
            ExecutionResult::Success(s) => s.note.as_deref(),
            ExecutionResult::Failure(f) => f.note.as_deref(),
        }
    }
}

impl From<Success> for ExecutionResult {
    fn from(success: Success) -> Self {
        ExecutionResult::Success(success)
    }
}

impl From<Failure> for ExecutionResult {
    fn from(failure: Failure) -> Self {
        ExecutionResult::Failure(failure)
    }
}
