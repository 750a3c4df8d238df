//! Output sink protocol
//!
//! Executors stream zero or more non-terminal events (`status`, `console`,
//! `output`) and then exactly one terminal event (`result` or `error`).
//! `EventEmitter` enforces that per invocation: once the terminal event has
//! been delivered, everything else is dropped.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::result::{ConsoleLine, ExecutionResult, Failure, StreamTag, Success};

/// A raw chunk of process output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub stream: StreamTag,
    pub text: String,
}

/// Event delivered to an output sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum OutputEvent {
    Status(String),
    Console(ConsoleLine),
    Output(OutputChunk),
    Result(Success),
    Error(Failure),
}

impl OutputEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutputEvent::Result(_) | OutputEvent::Error(_))
    }

    fn terminal(result: &ExecutionResult) -> Self {
        match result {
            ExecutionResult::Success(s) => OutputEvent::Result(s.clone()),
            ExecutionResult::Failure(f) => OutputEvent::Error(f.clone()),
        }
    }
}

/// Receiver of execution events
pub trait OutputSink: Send + Sync {
    fn emit(&self, event: OutputEvent);
}

impl<F> OutputSink for F
where
    F: Fn(OutputEvent) + Send + Sync,
{
    fn emit(&self, event: OutputEvent) {
        self(event)
    }
}

/// Sink that discards every event
pub struct NullSink;

impl OutputSink for NullSink {
    fn emit(&self, _event: OutputEvent) {}
}

/// Sink forwarding events into a tokio channel
pub struct ChannelSink(pub UnboundedSender<OutputEvent>);

impl OutputSink for ChannelSink {
    fn emit(&self, event: OutputEvent) {
        if self.0.send(event).is_err() {
            debug!("Output event receiver dropped");
        }
    }
}

struct EmitterInner {
    sink: Arc<dyn OutputSink>,
    terminated: AtomicBool,
}

/// Per-invocation handle executors write events through
#[derive(Clone)]
pub struct EventEmitter {
    inner: Arc<EmitterInner>,
}

impl EventEmitter {
    pub fn new(sink: Arc<dyn OutputSink>) -> Self {
        Self {
            inner: Arc::new(EmitterInner {
                sink,
                terminated: AtomicBool::new(false),
            }),
        }
    }

    /// Emitter with no attached sink
    pub fn silent() -> Self {
        Self::new(Arc::new(NullSink))
    }

    pub fn status(&self, message: impl Into<String>) {
        self.emit(OutputEvent::Status(message.into()));
    }

    pub fn console(&self, line: ConsoleLine) {
        self.emit(OutputEvent::Console(line));
    }

    pub fn output(&self, stream: StreamTag, text: impl Into<String>) {
        let text = text.into();
        if text.is_empty() {
            return;
        }
        self.emit(OutputEvent::Output(OutputChunk { stream, text }));
    }

    /// Deliver the terminal event. Returns false if one was already delivered.
    pub fn finish(&self, result: &ExecutionResult) -> bool {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.inner.sink.emit(OutputEvent::terminal(result));
        true
    }

    pub fn is_finished(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    fn emit(&self, event: OutputEvent) {
        if self.is_finished() {
            debug!("Dropping event emitted after terminal event: {:?}", event);
            return;
        }
        self.inner.sink.emit(event);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Sink recording every event in arrival order
    #[derive(Default)]
    pub struct RecordingSink {
        events: Mutex<Vec<OutputEvent>>,
    }

    impl RecordingSink {
        pub fn events(&self) -> Vec<OutputEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl OutputSink for RecordingSink {
        fn emit(&self, event: OutputEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    /// Assert the sequence ends with exactly one terminal event
    pub fn assert_single_terminal(events: &[OutputEvent]) {
        let terminals = events.iter().filter(|e| e.is_terminal()).count();
        assert_eq!(terminals, 1, "expected one terminal event in {:?}", events);
        assert!(events.last().map(|e| e.is_terminal()).unwrap_or(false));
    }
}
