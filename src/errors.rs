//! Error types raised inside executors before they are folded into an
//! `ExecutionResult`

use thiserror::Error;

/// Failure talking to the compile service
#[derive(Error, Debug)]
pub enum CompileServiceError {
    /// The request never produced an HTTP response (refused, DNS, timeout)
    #[error("compile service unreachable: {0}")]
    Unreachable(#[source] reqwest::Error),
    /// The service answered with a non-success status
    #[error("compile service returned {status}: {message}")]
    Status { status: u16, message: String },
    /// The service answered but the body could not be decoded
    #[error("invalid compile service response: {0}")]
    InvalidResponse(#[source] reqwest::Error),
}

impl CompileServiceError {
    /// Only transport failures justify falling back to the local interpreter
    pub fn is_transport(&self) -> bool {
        matches!(self, CompileServiceError::Unreachable(_))
    }
}

/// Failure preparing a lazily-loaded runtime
#[derive(Error, Debug, Clone)]
pub enum RuntimeLoadError {
    #[error("fallback compiler `{compiler}` is unavailable: {reason}")]
    ToolchainUnavailable { compiler: String, reason: String },
    #[error("process confinement is unavailable: {0}")]
    SandboxUnavailable(String),
    #[error("failed to load runtime: {0}")]
    Load(String),
}

/// Failure raised by the fallback interpreter
#[derive(Error, Debug)]
pub enum InterpreterError {
    #[error("{message}")]
    Exception {
        message: String,
        stack: Option<String>,
    },
    #[error("execution exceeded the {limit_ms}ms time limit")]
    TimedOut { limit_ms: u64 },
    #[error("interpreter I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl InterpreterError {
    pub fn exception(message: impl Into<String>, stack: Option<String>) -> Self {
        InterpreterError::Exception {
            message: message.into(),
            stack,
        }
    }

    /// Trace text for the failure detail, when the interpreter produced one
    pub fn stack(&self) -> Option<String> {
        match self {
            InterpreterError::Exception { stack, .. } => stack.clone(),
            InterpreterError::TimedOut { .. } => None,
            InterpreterError::Io(e) => Some(format!("{:?}", e)),
        }
    }
}
