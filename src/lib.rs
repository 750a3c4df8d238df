//! coderun - execution dispatch and sandboxing layer
//!
//! Routes `(code, language)` pairs to language executors: JavaScript runs in
//! an embedded, capability-restricted engine; C++ goes to a remote compile
//! service and degrades to a local fallback interpreter when the service is
//! unreachable. Progress is streamed through an output sink.

pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod events;
pub mod executor;
pub mod jobs;
pub mod languages;
pub mod redis_manager;
pub mod result;
pub mod worker;

pub use config::{OverflowPolicy, RunnerConfig};
pub use dispatcher::Dispatcher;
pub use events::{ChannelSink, EventEmitter, NullSink, OutputEvent, OutputSink};
pub use executor::{Executor, ExecutorRegistry};
pub use languages::LanguageTable;
pub use result::{ExecutionResult, Failure, Phase, Success};
