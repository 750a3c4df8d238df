//! Dispatcher - routes `(code, language)` pairs to executors
//!
//! Validation and language resolution happen synchronously, before any
//! executor is touched. The routed executor runs as its own task so a panic
//! inside it is reported as a runtime failure instead of unwinding into the
//! caller.

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

use crate::config::RunnerConfig;
use crate::events::{EventEmitter, OutputSink};
use crate::executor::{Executor, ExecutorRegistry};
use crate::languages::LanguageTable;
use crate::result::{ExecutionResult, Failure, Phase};

pub const MISSING_INPUT: &str = "missing code or language";

pub struct Dispatcher {
    languages: LanguageTable,
    executors: ExecutorRegistry,
}

impl Dispatcher {
    pub fn new(languages: LanguageTable, executors: ExecutorRegistry) -> Self {
        Self {
            languages,
            executors,
        }
    }

    /// Dispatcher over the built-in language table with one executor per language
    pub fn from_config(config: &RunnerConfig) -> anyhow::Result<Self> {
        let languages = LanguageTable::builtin()?;
        let executors = ExecutorRegistry::from_config(&languages, config)?;
        Ok(Self::new(languages, executors))
    }

    pub fn languages(&self) -> &LanguageTable {
        &self.languages
    }

    /// Resolve a language identifier (or alias) to its executor
    pub fn resolve(&self, language: &str) -> Result<(String, Arc<dyn Executor>), ExecutionResult> {
        let config = self.languages.resolve(language).ok_or_else(|| {
            ExecutionResult::unsupported(format!(
                "unsupported language: {} (supported: {})",
                language.trim(),
                self.languages.supported_identifiers().join(", ")
            ))
        })?;

        let executor = self.executors.get(&config.name).ok_or_else(|| {
            ExecutionResult::unsupported(format!(
                "no executor registered for language: {}",
                config.name
            ))
        })?;

        Ok((config.name.clone(), executor))
    }

    /// Execute source code in the given language
    pub async fn execute_code(
        &self,
        source_code: &str,
        language: &str,
        sink: Option<Arc<dyn OutputSink>>,
    ) -> ExecutionResult {
        if source_code.trim().is_empty() || language.trim().is_empty() {
            return ExecutionResult::unsupported(MISSING_INPUT);
        }

        let (canonical, executor) = match self.resolve(language) {
            Ok(resolved) => resolved,
            Err(rejection) => {
                warn!("Rejected execution request for language {:?}", language);
                return rejection;
            }
        };

        debug!("Dispatching {} bytes to {} executor", source_code.len(), canonical);

        let events = match sink {
            Some(sink) => EventEmitter::new(sink),
            None => EventEmitter::silent(),
        };

        let started = Instant::now();
        let task = {
            let events = events.clone();
            let source_code = source_code.to_string();
            tokio::spawn(async move { executor.execute(&source_code, &events).await })
        };

        let result = match task.await {
            Ok(result) => result,
            Err(join_error) => {
                let message = if join_error.is_panic() {
                    format!("executor panicked: {}", panic_message(join_error.into_panic()))
                } else {
                    "executor task was cancelled".to_string()
                };
                error!("{} executor failed: {}", canonical, message);
                Failure::new(Phase::Runtime, message, started.elapsed().as_millis() as u64)
                    .with_detail(format!("language={} executor task aborted", canonical))
                    .into()
            }
        };

        events.finish(&result);
        result
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
