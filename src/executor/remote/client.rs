//! HTTP client for the compile-and-run service

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::errors::CompileServiceError;

#[derive(Debug, Serialize)]
struct CompileRequest<'a> {
    code: &'a str,
}

/// Response body of the compile service
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResponse {
    #[serde(default)]
    pub success: bool,
    /// `compile` or `run`
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub killed: bool,
}

impl ServiceResponse {
    pub fn is_compile_failure(&self) -> bool {
        self.phase.as_deref() == Some("compile")
    }
}

/// Client bound to one service endpoint
pub struct CompileServiceClient {
    http: reqwest::Client,
    endpoint: String,
}

impl CompileServiceClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build compile service HTTP client")?;

        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Submit source code and decode the service's verdict
    pub async fn compile(&self, code: &str) -> Result<ServiceResponse, CompileServiceError> {
        debug!("POST {} ({} bytes)", self.endpoint, code.len());

        let response = self
            .http
            .post(&self.endpoint)
            .json(&CompileRequest { code })
            .send()
            .await
            .map_err(CompileServiceError::Unreachable)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CompileServiceError::Status {
                status: status.as_u16(),
                message: status_message(status, &body),
            });
        }

        response
            .json::<ServiceResponse>()
            .await
            .map_err(CompileServiceError::InvalidResponse)
    }
}

/// The JSON `error` field if present, else the body, else the status line
fn status_message(status: reqwest::StatusCode, body: &str) -> String {
    let from_json = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| value.get("error")?.as_str().map(str::to_string))
        .filter(|message| !message.is_empty());

    from_json.unwrap_or_else(|| {
        let body = body.trim();
        if body.is_empty() {
            status.to_string()
        } else {
            body.to_string()
        }
    })
}
