//! Chat-completion transport for upstream analyzers

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::RETRY_AFTER;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::error::{CounterpointError, Result};
use crate::utils::text::truncate_snippet;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Everything a transport can fail with. The classifier decides which of these are retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum UpstreamFailure {
    #[error("upstream timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("network error: {0}")]
    Network(String),
    #[error("upstream returned HTTP {status}: {body}")]
    Http {
        status: u16,
        retry_after_ms: Option<u64>,
        body: String,
    },
    #[error("malformed upstream response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send one chat request and return the assistant's text
    async fn complete(
        &self,
        request: &ChatRequest,
        api_key: &str,
    ) -> std::result::Result<String, UpstreamFailure>;
}

/// OpenAI-compatible `/chat/completions` client
pub struct HttpChatTransport {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpChatTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CounterpointError::Config {
                message: format!("Failed to build HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            timeout,
        })
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn map_send_error(&self, err: reqwest::Error) -> UpstreamFailure {
        if err.is_timeout() {
            UpstreamFailure::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else if err.is_decode() {
            UpstreamFailure::Malformed(err.to_string())
        } else {
            UpstreamFailure::Network(err.to_string())
        }
    }
}

/// `Retry-After` in delta-seconds form; HTTP-date values are ignored
pub fn parse_retry_after(value: &str) -> Option<u64> {
    let secs = value.trim().parse::<f64>().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some((secs * 1000.0).round() as u64)
    } else {
        None
    }
}

/// Pull the first choice's message text out of a chat-completion body
pub fn extract_completion_text(body: &Value) -> Option<String> {
    let content = body
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|m| m.get("content"))?;
    match content {
        Value::String(s) => Some(s.trim().to_string()),
        // Some providers return content parts
        Value::Array(parts) => {
            let joined = parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("");
            (!joined.trim().is_empty()).then(|| joined.trim().to_string())
        }
        _ => None,
    }
}

#[async_trait]
impl ChatTransport for HttpChatTransport {
    async fn complete(
        &self,
        request: &ChatRequest,
        api_key: &str,
    ) -> std::result::Result<String, UpstreamFailure> {
        let resp = self
            .client
            .post(self.url())
            .bearer_auth(api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after_ms = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body = resp
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read response body".to_string());
            return Err(UpstreamFailure::Http {
                status: status.as_u16(),
                retry_after_ms,
                body: truncate_snippet(body.trim(), 300),
            });
        }

        let body: Value = resp.json().await.map_err(|e| self.map_send_error(e))?;
        debug!(model = %request.model, "upstream completion received");
        extract_completion_text(&body)
            .ok_or_else(|| UpstreamFailure::Malformed("no choices[0].message.content".to_string()))
    }
}
