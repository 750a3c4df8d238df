//! Local compiler toolchain used as the fallback interpreter
//!
//! Loading runs the compiler with `--version` and then checks that a
//! confined child can be started. Running compiles the source into a scratch
//! directory and executes the binary, both inside the [`Sandbox`], streaming
//! stdout and stderr through the write hook as they arrive.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

use super::sandbox::{Sandbox, SandboxLimits};
use super::{Interpreter, InterpreterConfig, Pipeline, RuntimeLoader, Transform, WriteHook};
use crate::config::OverflowPolicy;
use crate::errors::{InterpreterError, RuntimeLoadError};
use crate::result::StreamTag;

/// Compilation gets its own generous limit, separate from the run limit
const COMPILE_TIME_LIMIT: Duration = Duration::from_secs(60);
const CHECK_TIME_LIMIT: Duration = Duration::from_secs(10);
const READ_CHUNK_SIZE: usize = 4096;
/// Tail of program stderr kept for the failure detail
const STDERR_DETAIL_LIMIT: usize = 64 * 1024;

/// Compiler flags selecting the integer-overflow behavior
pub fn overflow_flags(policy: OverflowPolicy) -> &'static [&'static str] {
    match policy {
        OverflowPolicy::Warn => &["-fwrapv", "-Woverflow"],
        OverflowPolicy::Fail => &["-ftrapv"],
    }
}

/// Loads a [`LocalToolchainInterpreter`] after checking the compiler exists
/// and that confinement works on this host
pub struct LocalToolchainLoader {
    compiler: String,
}

impl LocalToolchainLoader {
    pub fn new(compiler: impl Into<String>) -> Self {
        Self {
            compiler: compiler.into(),
        }
    }

    async fn ensure_confinement(&self, sandbox: Sandbox) -> Result<(), RuntimeLoadError> {
        let unavailable = RuntimeLoadError::SandboxUnavailable;

        let workdir = tempfile::Builder::new()
            .prefix("coderun-check-")
            .tempdir()
            .map_err(|e| unavailable(e.to_string()))?;
        sandbox
            .prepare_workdir(workdir.path())
            .map_err(|e| unavailable(e.to_string()))?;

        let mut cmd = Command::new(&self.compiler);
        cmd.arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        sandbox.confine(&mut cmd, workdir.path(), SandboxLimits::compile(CHECK_TIME_LIMIT));

        let status = tokio::time::timeout(CHECK_TIME_LIMIT, cmd.status())
            .await
            .map_err(|_| unavailable("confined check timed out".to_string()))?
            .map_err(|e| unavailable(e.to_string()))?;

        if status.success() {
            Ok(())
        } else {
            Err(unavailable(format!("confined check exited with {}", status)))
        }
    }
}

#[async_trait]
impl RuntimeLoader for LocalToolchainLoader {
    async fn load(&self) -> Result<Arc<dyn Interpreter>, RuntimeLoadError> {
        let unavailable = |reason: String| RuntimeLoadError::ToolchainUnavailable {
            compiler: self.compiler.clone(),
            reason,
        };

        let version_check = Command::new(&self.compiler)
            .arg("--version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(CHECK_TIME_LIMIT, version_check)
            .await
            .map_err(|_| unavailable("version check timed out".to_string()))?
            .map_err(|e| unavailable(e.to_string()))?;

        if !output.status.success() {
            return Err(unavailable(format!(
                "version check exited with {}",
                output.status
            )));
        }

        let version = String::from_utf8_lossy(&output.stdout);
        debug!(
            "Fallback compiler {}: {}",
            self.compiler,
            version.lines().next().unwrap_or_default()
        );

        let sandbox = Sandbox::for_current_user();
        self.ensure_confinement(sandbox).await?;

        Ok(Arc::new(LocalToolchainInterpreter::new(
            self.compiler.clone(),
            sandbox,
        )))
    }
}

/// Compiles and runs C++ with the local compiler inside a [`Sandbox`]
pub struct LocalToolchainInterpreter {
    compiler: String,
    sandbox: Sandbox,
}

impl LocalToolchainInterpreter {
    pub fn new(compiler: impl Into<String>, sandbox: Sandbox) -> Self {
        Self {
            compiler: compiler.into(),
            sandbox,
        }
    }

    /// Compile `source_path`; warnings on success go to the hook as stderr
    async fn compile(
        &self,
        workdir: &Path,
        source_path: &Path,
        binary_path: &Path,
        config: &InterpreterConfig,
        write: WriteHook<'_>,
    ) -> Result<(), InterpreterError> {
        let mut cmd = Command::new(&self.compiler);
        cmd.args(["-O2", "-std=c++17"])
            .args(overflow_flags(config.overflow))
            .arg("-o")
            .arg(binary_path)
            .arg(source_path)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        self.sandbox
            .confine(&mut cmd, workdir, SandboxLimits::compile(COMPILE_TIME_LIMIT));

        debug!("Compiling fallback program with {:?}", cmd);

        let output = tokio::time::timeout(COMPILE_TIME_LIMIT, cmd.output())
            .await
            .map_err(|_| InterpreterError::exception("compilation timed out", None))??;

        let diagnostics = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if output.status.success() {
            if !diagnostics.is_empty() {
                write(StreamTag::Stderr, &format!("{}\n", diagnostics));
            }
            return Ok(());
        }

        let message = diagnostics
            .lines()
            .find(|line| line.contains("error"))
            .unwrap_or("compilation failed")
            .to_string();
        Err(InterpreterError::exception(
            message,
            (!diagnostics.is_empty()).then_some(diagnostics),
        ))
    }

    async fn execute_binary(
        &self,
        workdir: &Path,
        binary_path: &Path,
        stdin: &str,
        limits: SandboxLimits,
        write: WriteHook<'_>,
    ) -> Result<(), InterpreterError> {
        let mut cmd = Command::new(binary_path);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        self.sandbox.confine(&mut cmd, workdir, limits);
        let mut child = cmd.spawn()?;

        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(stdin.as_bytes()).await?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| InterpreterError::exception("stdout was not captured", None))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| InterpreterError::exception("stderr was not captured", None))?;

        let (forwarded, stderr_tail) = tokio::join!(
            forward(stdout, StreamTag::Stdout, write),
            forward(stderr, StreamTag::Stderr, write),
        );
        forwarded?;
        let stderr_text = stderr_tail?.trim().to_string();

        let status = child.wait().await?;
        if status.success() {
            return Ok(());
        }

        let message = match status.code() {
            Some(code) => format!("program exited with code {}", code),
            None => "program was terminated by a signal".to_string(),
        };
        Err(InterpreterError::exception(
            message,
            (!stderr_text.is_empty()).then_some(stderr_text),
        ))
    }
}

#[async_trait]
impl Interpreter for LocalToolchainInterpreter {
    async fn run(
        &self,
        source: &str,
        stdin: &str,
        config: &InterpreterConfig,
        write: WriteHook<'_>,
    ) -> Result<(), InterpreterError> {
        let workdir = tempfile::Builder::new().prefix("coderun-").tempdir()?;
        self.sandbox.prepare_workdir(workdir.path())?;
        let source_path = workdir.path().join("main.cpp");
        let binary_path = workdir.path().join("main");

        tokio::fs::write(&source_path, source).await?;
        self.compile(workdir.path(), &source_path, &binary_path, config, write)
            .await?;

        // The child is killed when the timed-out future is dropped
        let limits = SandboxLimits::program(config.time_limit);
        tokio::time::timeout(
            config.time_limit,
            self.execute_binary(workdir.path(), &binary_path, stdin, limits, write),
        )
        .await
        .map_err(|_| InterpreterError::TimedOut {
            limit_ms: config.time_limit.as_millis() as u64,
        })?
    }

    /// A conforming compiler gets the source nearly untouched
    fn pipeline(&self) -> Pipeline {
        Pipeline::new(vec![
            Transform::StripInvisibleChars,
            Transform::NormalizeNewlines,
        ])
    }
}

/// Pass one pipe to the hook chunk by chunk. Returns the last
/// `STDERR_DETAIL_LIMIT` bytes read, for the failure detail.
async fn forward<R: AsyncRead + Unpin>(
    mut pipe: R,
    stream: StreamTag,
    write: WriteHook<'_>,
) -> std::io::Result<String> {
    let mut decoder = Utf8Decoder::default();
    let mut tail = String::new();
    let mut buf = [0u8; READ_CHUNK_SIZE];

    loop {
        let n = pipe.read(&mut buf).await?;
        let text = if n == 0 {
            decoder.finish()
        } else {
            decoder.decode(&buf[..n])
        };
        if !text.is_empty() {
            write(stream, &text);
            if stream == StreamTag::Stderr {
                tail.push_str(&text);
                keep_tail(&mut tail, STDERR_DETAIL_LIMIT);
            }
        }
        if n == 0 {
            return Ok(tail);
        }
    }
}

fn keep_tail(text: &mut String, max_bytes: usize) {
    if text.len() <= max_bytes {
        return;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text.drain(..start);
}

/// Decodes a byte stream read in chunks. A character split across two reads
/// is held back until its remaining bytes arrive.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut text = String::new();
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        // Incomplete sequence at the end
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        let consumed = self.pending.len() - rest.len();
        self.pending.drain(..consumed);
        text
    }

    /// Flush whatever is held back once the stream ends
    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}
