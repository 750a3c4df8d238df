//! Fallback runtime used when the compile service cannot be reached
//!
//! The runtime is loaded lazily, once per executor. Concurrent callers share
//! the in-flight load, and a failed load leaves the cell empty so the next
//! caller tries again.

pub mod preprocess;
pub mod sandbox;
pub mod toolchain;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::config::{OverflowPolicy, RunnerConfig};
use crate::errors::{InterpreterError, RuntimeLoadError};
use crate::result::StreamTag;

pub use preprocess::{Pipeline, Transform};
pub use sandbox::{Sandbox, SandboxLimits};
pub use toolchain::{LocalToolchainInterpreter, LocalToolchainLoader};

/// Receives each chunk of program output, tagged `Stdout` or `Stderr`, as
/// it is produced
pub type WriteHook<'a> = &'a (dyn Fn(StreamTag, &str) + Send + Sync);

/// Settings passed to the interpreter for one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterpreterConfig {
    pub overflow: OverflowPolicy,
    pub time_limit: Duration,
}

impl InterpreterConfig {
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            overflow: config.overflow_policy,
            time_limit: config.fallback_time_limit(),
        }
    }
}

/// A loaded fallback interpreter
#[async_trait]
pub trait Interpreter: Send + Sync {
    /// Run `source` with `stdin`, passing output chunks to `write` in order
    async fn run(
        &self,
        source: &str,
        stdin: &str,
        config: &InterpreterConfig,
        write: WriteHook<'_>,
    ) -> Result<(), InterpreterError>;

    /// Rewrites applied to the source before [`Interpreter::run`]
    fn pipeline(&self) -> Pipeline {
        Pipeline::fallback_default()
    }
}

/// Produces the interpreter. Called at most once per successful load.
#[async_trait]
pub trait RuntimeLoader: Send + Sync {
    async fn load(&self) -> Result<Arc<dyn Interpreter>, RuntimeLoadError>;
}

/// Memoized fallback interpreter
pub struct FallbackRuntime {
    loader: Arc<dyn RuntimeLoader>,
    interpreter: OnceCell<Arc<dyn Interpreter>>,
}

impl FallbackRuntime {
    pub fn new(loader: Arc<dyn RuntimeLoader>) -> Self {
        Self {
            loader,
            interpreter: OnceCell::new(),
        }
    }

    /// Return the interpreter, loading it on first use
    pub async fn get(&self) -> Result<Arc<dyn Interpreter>, RuntimeLoadError> {
        self.interpreter
            .get_or_try_init(|| async {
                info!("Loading fallback interpreter");
                let loaded = self.loader.load().await;
                match &loaded {
                    Ok(_) => info!("Fallback interpreter loaded"),
                    Err(e) => warn!("Fallback interpreter failed to load: {}", e),
                }
                loaded
            })
            .await
            .cloned()
    }

    pub fn is_loaded(&self) -> bool {
        self.interpreter.initialized()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Interpreter that records the source it was given
    #[derive(Default)]
    pub struct RecordingInterpreter {
        pub output: Vec<(StreamTag, String)>,
        pub error: Mutex<Option<InterpreterError>>,
        pub pipeline: Option<Pipeline>,
        received: Mutex<Vec<String>>,
    }

    impl RecordingInterpreter {
        /// Writes `chunks` to stdout
        pub fn with_output(chunks: &[&str]) -> Self {
            Self::with_streams(
                &chunks
                    .iter()
                    .map(|chunk| (StreamTag::Stdout, *chunk))
                    .collect::<Vec<_>>(),
            )
        }

        pub fn with_streams(chunks: &[(StreamTag, &str)]) -> Self {
            Self {
                output: chunks
                    .iter()
                    .map(|(stream, chunk)| (*stream, chunk.to_string()))
                    .collect(),
                ..Default::default()
            }
        }

        pub fn failing(error: InterpreterError) -> Self {
            Self {
                error: Mutex::new(Some(error)),
                ..Default::default()
            }
        }

        pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
            self.pipeline = Some(pipeline);
            self
        }

        pub fn received(&self) -> Vec<String> {
            self.received.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Interpreter for RecordingInterpreter {
        async fn run(
            &self,
            source: &str,
            _stdin: &str,
            _config: &InterpreterConfig,
            write: WriteHook<'_>,
        ) -> Result<(), InterpreterError> {
            self.received.lock().unwrap().push(source.to_string());
            for (stream, chunk) in &self.output {
                write(*stream, chunk);
            }
            match self.error.lock().unwrap().take() {
                Some(error) => Err(error),
                None => Ok(()),
            }
        }

        fn pipeline(&self) -> Pipeline {
            self.pipeline
                .clone()
                .unwrap_or_else(Pipeline::fallback_default)
        }
    }

    /// Loader that counts loads and can fail a number of times first
    pub struct CountingLoader {
        pub interpreter: Arc<RecordingInterpreter>,
        pub loads: AtomicUsize,
        failures_left: AtomicUsize,
        delay: Duration,
    }

    impl CountingLoader {
        pub fn new(interpreter: Arc<RecordingInterpreter>) -> Self {
            Self {
                interpreter,
                loads: AtomicUsize::new(0),
                failures_left: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        pub fn failing_first(mut self, failures: usize) -> Self {
            self.failures_left = AtomicUsize::new(failures);
            self
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn load_count(&self) -> usize {
            self.loads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RuntimeLoader for CountingLoader {
        async fn load(&self) -> Result<Arc<dyn Interpreter>, RuntimeLoadError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let failed = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(RuntimeLoadError::Load("interpreter bundle missing".to_string()));
            }
            Ok(self.interpreter.clone())
        }
    }
}
