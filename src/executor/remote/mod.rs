//! Remote-compile executor
//!
//! Source is sent to the compile service. When the service cannot be reached
//! at all, the executor degrades to the local fallback interpreter. Compile
//! errors, run errors and HTTP error statuses are reported as they are and
//! never trigger the fallback.

pub mod client;

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

use self::client::{CompileServiceClient, ServiceResponse};
use super::fallback::{FallbackRuntime, InterpreterConfig, LocalToolchainLoader, RuntimeLoader};
use super::Executor;
use crate::config::RunnerConfig;
use crate::errors::{CompileServiceError, InterpreterError, RuntimeLoadError};
use crate::events::EventEmitter;
use crate::result::{
    stderr_lines, ConsoleLine, ExecutionResult, Failure, OutputBudget, Phase, StreamTag,
    Success, DEGRADED_NOTE, KILLED_NOTE, NO_OUTPUT, OUTPUT_TRUNCATED,
};

pub const REMOTE_STATUS: &str = "Compiling and running remotely...";
pub const DEGRADED_STATUS: &str =
    "Compile service unreachable, running with the fallback interpreter...";
pub const LOADING_STATUS: &str = "Loading the fallback interpreter...";

pub struct RemoteCompileExecutor {
    client: CompileServiceClient,
    fallback: FallbackRuntime,
    interpreter_config: InterpreterConfig,
    max_output_bytes: usize,
}

impl RemoteCompileExecutor {
    pub fn new(
        endpoint: impl Into<String>,
        config: &RunnerConfig,
        loader: Arc<dyn RuntimeLoader>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            client: CompileServiceClient::new(endpoint, config.compile_request_timeout())?,
            fallback: FallbackRuntime::new(loader),
            interpreter_config: InterpreterConfig::from_config(config),
            max_output_bytes: config.max_output_bytes,
        })
    }

    /// Executor whose fallback is the locally installed compiler
    pub fn with_local_toolchain(
        endpoint: impl Into<String>,
        config: &RunnerConfig,
    ) -> anyhow::Result<Self> {
        let loader = Arc::new(LocalToolchainLoader::new(config.fallback_compiler.clone()));
        Self::new(endpoint, config, loader)
    }

    async fn run(&self, source: &str, events: &EventEmitter) -> ExecutionResult {
        let started = Instant::now();
        events.status(REMOTE_STATUS);

        match self.client.compile(source).await {
            Ok(response) => interpret(response, events, started),
            Err(e) if e.is_transport() => {
                warn!("{}; falling back to local interpreter", e);
                self.run_fallback(source, events, started).await
            }
            Err(CompileServiceError::Status { status, message }) => {
                warn!("Compile service returned {}: {}", status, message);
                Failure::new(Phase::Runtime, message, elapsed_ms(started))
                    .with_detail(format!("HTTP {}", status))
                    .into()
            }
            Err(e) => {
                warn!("{}", e);
                Failure::new(Phase::Runtime, e.to_string(), elapsed_ms(started)).into()
            }
        }
    }

    async fn run_fallback(
        &self,
        source: &str,
        events: &EventEmitter,
        started: Instant,
    ) -> ExecutionResult {
        events.status(DEGRADED_STATUS);
        if !self.fallback.is_loaded() {
            events.status(LOADING_STATUS);
        }

        let interpreter = match self.fallback.get().await {
            Ok(interpreter) => interpreter,
            Err(e) => {
                return Failure::new(
                    Phase::Transport,
                    format!("compile service unreachable and {}", e),
                    elapsed_ms(started),
                )
                .with_note(DEGRADED_NOTE)
                .into()
            }
        };

        let pipeline = interpreter.pipeline();
        debug!(
            "Preprocessing fallback source with [{}]",
            pipeline
                .transforms()
                .iter()
                .map(|t| t.name())
                .collect::<Vec<_>>()
                .join(", ")
        );
        let code = pipeline.apply(source);
        let captured = Mutex::new(CapturedOutput::new(self.max_output_bytes));
        let write = |stream: StreamTag, chunk: &str| {
            let admitted = match captured.lock() {
                Ok(mut captured) => captured.push(stream, chunk),
                Err(_) => None,
            };
            if let Some(text) = admitted {
                events.output(stream, text);
            }
        };

        let outcome = interpreter
            .run(&code, "", &self.interpreter_config, &write)
            .await;
        let execution_time_ms = elapsed_ms(started);
        let CapturedOutput { stdout, stderr, .. } = captured
            .into_inner()
            .unwrap_or_else(|_| CapturedOutput::new(0));

        match outcome {
            Ok(()) => Success {
                result_value: Some(or_no_output(stdout)),
                console_lines: stderr_lines(&stderr),
                execution_time_ms,
                note: Some(DEGRADED_NOTE.to_string()),
                killed: false,
            }
            .into(),
            Err(e) => {
                let mut partial: Vec<ConsoleLine> = stdout
                    .lines()
                    .filter(|line| !line.is_empty())
                    .map(|line| ConsoleLine::new(StreamTag::Stdout, line))
                    .collect();
                partial.extend(stderr_lines(&stderr));
                let mut failure = Failure::new(Phase::Runtime, e.to_string(), execution_time_ms)
                    .with_console(partial)
                    .with_note(DEGRADED_NOTE);
                if let Some(stack) = e.stack() {
                    failure = failure.with_detail(stack);
                }
                if matches!(e, InterpreterError::TimedOut { .. }) {
                    failure = failure.killed();
                }
                failure.into()
            }
        }
    }
}

#[async_trait]
impl Executor for RemoteCompileExecutor {
    async fn load_runtime(&self) -> Result<(), RuntimeLoadError> {
        self.fallback.get().await.map(|_| ())
    }

    async fn execute(&self, source: &str, events: &EventEmitter) -> ExecutionResult {
        let result = self.run(source, events).await;

        info!(
            "Remote execution via {} finished: success={}, killed={}, time_ms={}",
            self.client.endpoint(),
            result.is_success(),
            result.is_killed(),
            result.execution_time_ms()
        );

        events.finish(&result);
        result
    }
}

/// Program output of one fallback run, kept within the output cap
struct CapturedOutput {
    stdout: String,
    stderr: String,
    budget: OutputBudget,
}

impl CapturedOutput {
    fn new(max_bytes: usize) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            budget: OutputBudget::new(max_bytes),
        }
    }

    /// Keep the admitted part of `chunk` and return it for streaming. The
    /// chunk that hits the cap also carries the truncation marker.
    fn push(&mut self, stream: StreamTag, chunk: &str) -> Option<String> {
        let (kept, exhausted) = self.budget.admit(chunk);
        if kept.is_empty() && !exhausted {
            return None;
        }

        let mut text = kept.to_string();
        if exhausted {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(OUTPUT_TRUNCATED);
            text.push('\n');
        }

        let target = match stream {
            StreamTag::Stderr => &mut self.stderr,
            _ => &mut self.stdout,
        };
        target.push_str(&text);
        Some(text)
    }
}

/// Map a decoded service response onto the result model
fn interpret(response: ServiceResponse, events: &EventEmitter, started: Instant) -> ExecutionResult {
    let execution_time_ms = elapsed_ms(started);
    let stdout = response.output.clone().unwrap_or_default();
    let stderr = response.stderr.clone().unwrap_or_default();

    events.output(StreamTag::Stdout, stdout.as_str());
    events.output(StreamTag::Stderr, stderr.as_str());

    if response.is_compile_failure() {
        let message = response
            .error
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| "compilation failed".to_string());
        let mut failure = Failure::new(Phase::Compile, message, execution_time_ms)
            .with_console(stderr_lines(&stderr));
        if !stderr.trim().is_empty() {
            failure = failure.with_detail(stderr);
        }
        return failure.into();
    }

    if response.killed {
        return Success {
            result_value: Some(or_no_output(stdout)),
            console_lines: stderr_lines(&stderr),
            execution_time_ms,
            note: Some(KILLED_NOTE.to_string()),
            killed: true,
        }
        .into();
    }

    if !response.success {
        let message = response
            .error
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| match response.exit_code {
                Some(code) => format!("program exited with code {}", code),
                None => "execution failed".to_string(),
            });
        let mut failure = Failure::new(Phase::Runtime, message, execution_time_ms)
            .with_console(stderr_lines(&stderr));
        if let Some(detail) = run_detail(&stderr, response.exit_code) {
            failure = failure.with_detail(detail);
        }
        return failure.into();
    }

    Success {
        result_value: Some(or_no_output(stdout)),
        console_lines: stderr_lines(&stderr),
        execution_time_ms,
        note: None,
        killed: false,
    }
    .into()
}

fn run_detail(stderr: &str, exit_code: Option<i32>) -> Option<String> {
    let stderr = stderr.trim();
    match (stderr.is_empty(), exit_code) {
        (true, None) => None,
        (true, Some(code)) => Some(format!("exit code {}", code)),
        (false, None) => Some(stderr.to_string()),
        (false, Some(code)) => Some(format!("{}\nexit code {}", stderr, code)),
    }
}

fn or_no_output(output: String) -> String {
    if output.is_empty() {
        NO_OUTPUT.to_string()
    } else {
        output
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::{assert_single_terminal, RecordingSink};
    use crate::events::OutputEvent;
    use crate::executor::fallback::testing::{CountingLoader, RecordingInterpreter};
    use crate::executor::fallback::{Pipeline, Transform};
    use axum::{http::StatusCode, routing::post, Json, Router};
    use serde_json::{json, Value};
    use tokio::net::TcpListener;

    const SERVICE_PATH: &str = "/api/compile/cpp";
    const UNREACHABLE: &str = "http://127.0.0.1:1/api/compile/cpp";

    struct StubService {
        endpoint: String,
        requests: Arc<Mutex<Vec<Value>>>,
    }

    /// Compile service that answers every request with the same response
    async fn stub_service(status: StatusCode, body: String) -> StubService {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = requests.clone();

        let app = Router::new().route(
            SERVICE_PATH,
            post(move |Json(request): Json<Value>| {
                let body = body.clone();
                let recorded = recorded.clone();
                async move {
                    recorded.lock().unwrap().push(request);
                    (status, body)
                }
            }),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        StubService {
            endpoint: format!("http://{}{}", addr, SERVICE_PATH),
            requests,
        }
    }

    async fn stub_json(body: Value) -> StubService {
        stub_service(StatusCode::OK, body.to_string()).await
    }

    fn executor_with(
        endpoint: &str,
        interpreter: Arc<RecordingInterpreter>,
    ) -> (RemoteCompileExecutor, Arc<CountingLoader>) {
        let loader = Arc::new(CountingLoader::new(interpreter));
        let executor =
            RemoteCompileExecutor::new(endpoint, &RunnerConfig::default(), loader.clone()).unwrap();
        (executor, loader)
    }

    async fn execute(
        executor: &RemoteCompileExecutor,
        source: &str,
    ) -> (ExecutionResult, Vec<OutputEvent>) {
        let sink = Arc::new(RecordingSink::default());
        let events = EventEmitter::new(sink.clone());
        let result = executor.execute(source, &events).await;
        (result, sink.events())
    }

    #[tokio::test]
    async fn test_successful_run() {
        let service = stub_json(json!({"success": true, "output": "42\n", "exitCode": 0})).await;
        let (executor, loader) = executor_with(&service.endpoint, Default::default());

        let (result, events) = execute(&executor, "int main() {}").await;

        let ExecutionResult::Success(success) = &result else {
            panic!("expected success, got {:?}", result);
        };
        assert_eq!(success.result_value.as_deref(), Some("42\n"));
        assert!(!success.killed);
        assert_eq!(success.note, None);

        assert_eq!(events[0], OutputEvent::Status(REMOTE_STATUS.to_string()));
        assert!(events.iter().any(|e| matches!(
            e,
            OutputEvent::Output(chunk) if chunk.stream == StreamTag::Stdout && chunk.text == "42\n"
        )));
        assert_single_terminal(&events);

        assert_eq!(
            service.requests.lock().unwrap().as_slice(),
            &[json!({"code": "int main() {}"})]
        );
        assert_eq!(loader.load_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_output_is_reported() {
        let service = stub_json(json!({"success": true, "output": ""})).await;
        let (executor, _) = executor_with(&service.endpoint, Default::default());

        let (result, _) = execute(&executor, "int main() {}").await;

        let ExecutionResult::Success(success) = result else {
            panic!("expected success");
        };
        assert_eq!(success.result_value.as_deref(), Some(NO_OUTPUT));
    }

    #[tokio::test]
    async fn test_compile_error() {
        let service =
            stub_json(json!({"success": false, "phase": "compile", "error": "expected ';'"})).await;
        let (executor, loader) = executor_with(&service.endpoint, Default::default());

        let (result, events) = execute(&executor, "int main() { return 0 }").await;

        let ExecutionResult::Failure(failure) = &result else {
            panic!("expected failure");
        };
        assert_eq!(failure.phase, Phase::Compile);
        assert!(failure.error_message.contains("expected ';'"));
        assert!(matches!(events.last(), Some(OutputEvent::Error(_))));
        assert_single_terminal(&events);
        assert_eq!(loader.load_count(), 0);
    }

    #[tokio::test]
    async fn test_killed_run_is_qualified_success() {
        let service =
            stub_json(json!({"success": true, "killed": true, "output": "partial"})).await;
        let (executor, _) = executor_with(&service.endpoint, Default::default());

        let (result, events) = execute(&executor, "int main() { for (;;); }").await;

        let ExecutionResult::Success(success) = &result else {
            panic!("killed run must not be a failure");
        };
        assert!(success.killed);
        assert_eq!(success.result_value.as_deref(), Some("partial"));
        assert_eq!(success.note.as_deref(), Some(KILLED_NOTE));
        assert!(matches!(events.last(), Some(OutputEvent::Result(_))));
    }

    #[tokio::test]
    async fn test_run_failure_carries_stderr_and_exit_code() {
        let service = stub_json(json!({
            "success": false,
            "phase": "run",
            "stderr": "Segmentation fault\n",
            "exitCode": 139
        }))
        .await;
        let (executor, loader) = executor_with(&service.endpoint, Default::default());

        let (result, _) = execute(&executor, "int main() { *(int*)0 = 1; }").await;

        let ExecutionResult::Failure(failure) = &result else {
            panic!("expected failure");
        };
        assert_eq!(failure.phase, Phase::Runtime);
        assert_eq!(failure.error_message, "program exited with code 139");
        assert_eq!(
            failure.error_detail.as_deref(),
            Some("Segmentation fault\nexit code 139")
        );
        assert_eq!(
            failure.console_lines,
            vec![ConsoleLine::new(StreamTag::Stderr, "Segmentation fault")]
        );
        assert_eq!(loader.load_count(), 0);
    }

    #[tokio::test]
    async fn test_http_error_does_not_fall_back() {
        let service = stub_service(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"error": "worker crashed"}).to_string(),
        )
        .await;
        let (executor, loader) = executor_with(&service.endpoint, Default::default());

        let (result, events) = execute(&executor, "int main() {}").await;

        let ExecutionResult::Failure(failure) = &result else {
            panic!("expected failure");
        };
        assert_eq!(failure.phase, Phase::Runtime);
        assert_eq!(failure.error_message, "worker crashed");
        assert_eq!(failure.note, None);
        assert_eq!(loader.load_count(), 0);
        assert!(!events
            .iter()
            .any(|e| *e == OutputEvent::Status(DEGRADED_STATUS.to_string())));
    }

    #[tokio::test]
    async fn test_invalid_body_is_runtime_failure() {
        let service = stub_service(StatusCode::OK, "not json".to_string()).await;
        let (executor, loader) = executor_with(&service.endpoint, Default::default());

        let (result, _) = execute(&executor, "int main() {}").await;

        assert_eq!(result.phase(), Some(Phase::Runtime));
        assert_eq!(loader.load_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_service_uses_fallback() {
        let interpreter = Arc::new(RecordingInterpreter::with_output(&["Hello", " world\n"]));
        let (executor, loader) = executor_with(UNREACHABLE, interpreter.clone());

        let (result, events) = execute(
            &executor,
            "#include <iostream>\nint main() { std::cout << \"Hello\u{e9}\"; }",
        )
        .await;

        let ExecutionResult::Success(success) = &result else {
            panic!("expected fallback success, got {:?}", result);
        };
        assert_eq!(success.result_value.as_deref(), Some("Hello world\n"));
        assert_eq!(success.note.as_deref(), Some(DEGRADED_NOTE));

        let received = interpreter.received();
        assert_eq!(received.len(), 1);
        assert!(received[0].is_ascii());
        assert!(received[0].contains("cout << \"Hello\";"));
        assert!(received[0].contains("using namespace std;"));

        assert!(events.contains(&OutputEvent::Status(DEGRADED_STATUS.to_string())));
        let chunks: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                OutputEvent::Output(chunk) => Some(chunk.text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(chunks, vec!["Hello", " world\n"]);
        assert_single_terminal(&events);
        assert_eq!(loader.load_count(), 1);

        // The loaded interpreter is reused
        execute(&executor, "int main() {}").await;
        assert_eq!(loader.load_count(), 1);
    }

    #[tokio::test]
    async fn test_fallback_load_failure_is_transport() {
        let loader = Arc::new(
            CountingLoader::new(Arc::new(RecordingInterpreter::default())).failing_first(1),
        );
        let executor =
            RemoteCompileExecutor::new(UNREACHABLE, &RunnerConfig::default(), loader.clone())
                .unwrap();

        let (result, events) = execute(&executor, "int main() {}").await;

        let ExecutionResult::Failure(failure) = &result else {
            panic!("expected failure");
        };
        assert_eq!(failure.phase, Phase::Transport);
        assert_eq!(failure.note.as_deref(), Some(DEGRADED_NOTE));
        assert_single_terminal(&events);

        // The next caller retries the load
        let (retried, _) = execute(&executor, "int main() {}").await;
        assert!(retried.is_success());
        assert_eq!(loader.load_count(), 2);
    }

    #[tokio::test]
    async fn test_fallback_exception_and_timeout() {
        let interpreter = Arc::new(RecordingInterpreter::failing(InterpreterError::exception(
            "program exited with code 1",
            Some("assertion failed".to_string()),
        )));
        let (executor, _) = executor_with(UNREACHABLE, interpreter);

        let (result, _) = execute(&executor, "int main() { return 1; }").await;
        let ExecutionResult::Failure(failure) = &result else {
            panic!("expected failure");
        };
        assert_eq!(failure.phase, Phase::Runtime);
        assert_eq!(failure.error_detail.as_deref(), Some("assertion failed"));
        assert_eq!(failure.note.as_deref(), Some(DEGRADED_NOTE));
        assert!(!failure.killed);

        let interpreter = Arc::new(RecordingInterpreter::failing(InterpreterError::TimedOut {
            limit_ms: 10_000,
        }));
        let (executor, _) = executor_with(UNREACHABLE, interpreter);

        let (result, _) = execute(&executor, "int main() { for (;;); }").await;
        assert!(result.is_killed());
        assert_eq!(result.phase(), Some(Phase::Runtime));
        assert_eq!(result.note(), Some(DEGRADED_NOTE));
    }

    #[tokio::test]
    async fn test_fallback_uses_interpreter_pipeline() {
        let source =
            "#include <iostream>\n#include <algorithm>\nint count = 3; int main(){ std::cout << count; }";
        let interpreter = Arc::new(
            RecordingInterpreter::with_output(&["3"]).with_pipeline(Pipeline::new(vec![
                Transform::StripInvisibleChars,
                Transform::NormalizeNewlines,
            ])),
        );
        let (executor, _) = executor_with(UNREACHABLE, interpreter.clone());

        let (result, _) = execute(&executor, source).await;

        assert!(result.is_success());
        assert_eq!(interpreter.received(), vec![source.to_string()]);
    }

    #[tokio::test]
    async fn test_fallback_stderr_becomes_console_lines() {
        let interpreter = Arc::new(RecordingInterpreter::with_streams(&[
            (StreamTag::Stderr, "main.cpp:3: warning: integer overflow\n"),
            (StreamTag::Stdout, "ok\n"),
        ]));
        let (executor, _) = executor_with(UNREACHABLE, interpreter);

        let (result, events) = execute(&executor, "int main() {}").await;

        let ExecutionResult::Success(success) = &result else {
            panic!("expected success, got {:?}", result);
        };
        assert_eq!(success.result_value.as_deref(), Some("ok\n"));
        assert_eq!(
            success.console_lines,
            vec![ConsoleLine::new(
                StreamTag::Stderr,
                "main.cpp:3: warning: integer overflow"
            )]
        );
        assert!(events.iter().any(|e| matches!(
            e,
            OutputEvent::Output(chunk) if chunk.stream == StreamTag::Stderr
        )));
    }

    #[tokio::test]
    async fn test_fallback_failure_keeps_stdout_and_stderr() {
        let interpreter = Arc::new(RecordingInterpreter::with_streams(&[
            (StreamTag::Stdout, "partial\n"),
            (StreamTag::Stderr, "assertion failed\n"),
        ]));
        *interpreter.error.lock().unwrap() = Some(InterpreterError::exception(
            "program exited with code 134",
            Some("assertion failed".to_string()),
        ));
        let (executor, _) = executor_with(UNREACHABLE, interpreter);

        let (result, _) = execute(&executor, "int main() {}").await;

        assert_eq!(
            result.console_lines(),
            &[
                ConsoleLine::new(StreamTag::Stdout, "partial"),
                ConsoleLine::new(StreamTag::Stderr, "assertion failed"),
            ]
        );
    }

    #[tokio::test]
    async fn test_fallback_output_is_capped() {
        let interpreter = Arc::new(RecordingInterpreter::with_output(&["12345", "67890", "more"]));
        let loader = Arc::new(CountingLoader::new(interpreter));
        let config = RunnerConfig {
            max_output_bytes: 8,
            ..Default::default()
        };
        let executor = RemoteCompileExecutor::new(UNREACHABLE, &config, loader).unwrap();

        let (result, events) = execute(&executor, "int main() {}").await;

        let ExecutionResult::Success(success) = &result else {
            panic!("expected success, got {:?}", result);
        };
        let expected = format!("12345678\n{}\n", OUTPUT_TRUNCATED);
        assert_eq!(success.result_value.as_deref(), Some(expected.as_str()));

        let chunks: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                OutputEvent::Output(chunk) => Some(chunk.text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            chunks,
            vec!["12345".to_string(), format!("678\n{}\n", OUTPUT_TRUNCATED)]
        );
    }

    #[tokio::test]
    async fn test_loading_status_only_before_first_load() {
        let (executor, _) = executor_with(UNREACHABLE, Default::default());
        let loading = OutputEvent::Status(LOADING_STATUS.to_string());

        let (_, first) = execute(&executor, "int main() {}").await;
        assert!(first.contains(&loading));

        let (_, second) = execute(&executor, "int main() {}").await;
        assert!(!second.contains(&loading));
        assert!(second.contains(&OutputEvent::Status(DEGRADED_STATUS.to_string())));
    }

    #[tokio::test]
    async fn test_load_runtime_is_idempotent() {
        let (executor, loader) = executor_with(UNREACHABLE, Default::default());

        executor.load_runtime().await.unwrap();
        executor.load_runtime().await.unwrap();
        executor.load_runtime().await.unwrap();

        assert_eq!(loader.load_count(), 1);
    }
}
