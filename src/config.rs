//! Runner configuration
//!
//! Loaded from environment variables, falling back to fixed defaults.

use std::time::Duration;
use tracing::warn;

/// Integer-overflow behavior requested from the fallback interpreter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Wrap and warn instead of aborting the program
    #[default]
    Warn,
    /// Abort the program on signed overflow
    Fail,
}

/// Configuration shared by the executors
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Base URL of the compile-and-run service
    pub compile_service_url: String,
    /// Request timeout for the compile service (default: 30000ms)
    pub compile_request_timeout_ms: u64,
    /// Wall-clock limit for in-process scripts (default: 10000ms)
    pub script_time_limit_ms: u64,
    /// Heap limit for in-process scripts (default: 64MB)
    pub script_memory_limit_mb: usize,
    /// Compiler checked at load and used by the fallback interpreter
    pub fallback_compiler: String,
    /// Wall-clock limit for fallback runs (default: 10000ms)
    pub fallback_time_limit_ms: u64,
    pub overflow_policy: OverflowPolicy,
    /// Cap on console and program output kept per run (default: 1MiB)
    pub max_output_bytes: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            compile_service_url: "http://localhost:3001".to_string(),
            compile_request_timeout_ms: 30_000,
            script_time_limit_ms: 10_000,
            script_memory_limit_mb: 64,
            fallback_compiler: "g++".to_string(),
            fallback_time_limit_ms: 10_000,
            overflow_policy: OverflowPolicy::Warn,
            max_output_bytes: 1024 * 1024,
        }
    }
}

impl RunnerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let overflow_policy = match std::env::var("FALLBACK_OVERFLOW_POLICY") {
            Ok(value) if value.eq_ignore_ascii_case("fail") => OverflowPolicy::Fail,
            Ok(value) if value.eq_ignore_ascii_case("warn") => OverflowPolicy::Warn,
            Ok(value) => {
                warn!("Unknown FALLBACK_OVERFLOW_POLICY {:?}, using warn", value);
                OverflowPolicy::Warn
            }
            Err(_) => defaults.overflow_policy,
        };

        Self {
            compile_service_url: std::env::var("COMPILE_SERVICE_URL")
                .unwrap_or(defaults.compile_service_url),
            compile_request_timeout_ms: env_number(
                "COMPILE_REQUEST_TIMEOUT_MS",
                defaults.compile_request_timeout_ms,
            ),
            script_time_limit_ms: env_number("SCRIPT_TIME_LIMIT_MS", defaults.script_time_limit_ms),
            script_memory_limit_mb: env_number(
                "SCRIPT_MEMORY_LIMIT_MB",
                defaults.script_memory_limit_mb,
            ),
            fallback_compiler: std::env::var("FALLBACK_CXX").unwrap_or(defaults.fallback_compiler),
            fallback_time_limit_ms: env_number(
                "FALLBACK_TIME_LIMIT_MS",
                defaults.fallback_time_limit_ms,
            ),
            overflow_policy,
            max_output_bytes: env_number("MAX_OUTPUT_BYTES", defaults.max_output_bytes),
        }
    }

    pub fn compile_request_timeout(&self) -> Duration {
        Duration::from_millis(self.compile_request_timeout_ms)
    }

    pub fn script_time_limit(&self) -> Duration {
        Duration::from_millis(self.script_time_limit_ms)
    }

    pub fn fallback_time_limit(&self) -> Duration {
        Duration::from_millis(self.fallback_time_limit_ms)
    }

    /// Full URL for a compile service path
    pub fn service_endpoint(&self, service_path: &str) -> String {
        format!(
            "{}/{}",
            self.compile_service_url.trim_end_matches('/'),
            service_path.trim_start_matches('/')
        )
    }
}

fn env_number<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(value) => value.parse().unwrap_or_else(|_| {
            warn!("Invalid value for {}: {:?}, using default", key, value);
            default
        }),
        Err(_) => default,
    }
}
