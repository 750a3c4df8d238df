//! Executor module - language execution abstraction layer
//!
//! This module provides a unified interface for running source code:
//! - `InProcessExecutor`: JavaScript evaluated in a capability-restricted engine
//! - `RemoteCompileExecutor`: C++ sent to the compile service, with a local
//!   fallback interpreter when the service is unreachable
//!
//! The executor module does NOT:
//! - Resolve language aliases (that's the dispatcher's job)
//! - Persist anything about past executions

pub mod fallback;
pub mod in_process;
pub mod remote;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::RunnerConfig;
use crate::errors::RuntimeLoadError;
use crate::events::EventEmitter;
use crate::languages::{ExecutorKind, LanguageTable};
use crate::result::ExecutionResult;

pub use fallback::{FallbackRuntime, Interpreter, InterpreterConfig, RuntimeLoader};
pub use in_process::InProcessExecutor;
pub use remote::RemoteCompileExecutor;

/// Language-specific execution strategy
#[async_trait]
pub trait Executor: Send + Sync {
    /// Prepare the executor's runtime. Safe to call repeatedly; only the
    /// first successful call does any work.
    async fn load_runtime(&self) -> Result<(), RuntimeLoadError>;

    /// Run source code, streaming events through `events`.
    ///
    /// Never fails: every internal error becomes a `Failure`. Implementations
    /// deliver the terminal event themselves before returning.
    async fn execute(&self, source: &str, events: &EventEmitter) -> ExecutionResult;
}

/// Executors keyed by canonical language identifier
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one executor per language in the table
    pub fn from_config(languages: &LanguageTable, config: &RunnerConfig) -> anyhow::Result<Self> {
        let mut registry = Self::new();

        for language in languages.languages() {
            let executor: Arc<dyn Executor> = match language.executor {
                ExecutorKind::InProcess => Arc::new(InProcessExecutor::new(config)),
                ExecutorKind::RemoteCompile => {
                    let service_path = language.service_path.as_deref().ok_or_else(|| {
                        anyhow::anyhow!("Remote language {} has no service_path", language.name)
                    })?;
                    Arc::new(RemoteCompileExecutor::with_local_toolchain(
                        config.service_endpoint(service_path),
                        config,
                    )?)
                }
            };
            registry.register(&language.name, executor);
        }

        Ok(registry)
    }

    pub fn register(&mut self, language: &str, executor: Arc<dyn Executor>) {
        self.executors.insert(language.to_string(), executor);
    }

    pub fn get(&self, language: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(language).cloned()
    }
}
