//! Summarization through the OpenRouter chat completions API.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::retry::RetryConfig;
use crate::context::summarizer::{SummaryBackend, SummaryFuture, SummaryRequest};
use crate::error::SummaryError;

pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Model used when none is configured.
pub const DEFAULT_SUMMARY_MODEL: &str = "z-ai/glm-5";

/// Environment variable holding the API key.
pub const API_KEY_ENV: &str = "OPENROUTER_KEY";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

// ── Wire types ─────────────────────────────────────────────────────

#[derive(Debug, Serialize, PartialEq)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
    #[serde(default)]
    code: Option<u16>,
}

#[derive(Deserialize, Debug)]
struct UsageInfo {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

// ── Backend ────────────────────────────────────────────────────────

/// [`SummaryBackend`] that asks a hosted model for the summary.
///
/// Transient failures are retried per [`RetryConfig`]. The request asks for
/// at most `target_tokens` of output; whether the result is actually small
/// enough is checked by the compaction engine.
pub struct OpenRouterSummarizer {
    client: reqwest::Client,
    api_key: String,
    model: String,
    temperature: f32,
    timeout: Duration,
    retry: RetryConfig,
}

impl OpenRouterSummarizer {
    pub fn new(api_key: impl Into<String>) -> Result<Self, SummaryError> {
        Self::with_timeout(api_key, DEFAULT_TIMEOUT)
    }

    /// Build with a per-request HTTP timeout.
    pub fn with_timeout(api_key: impl Into<String>, timeout: Duration) -> Result<Self, SummaryError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("ctxkeep/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| SummaryError::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            model: DEFAULT_SUMMARY_MODEL.to_string(),
            temperature: 0.2,
            timeout,
            retry: RetryConfig::default(),
        })
    }

    /// Read the key from `OPENROUTER_KEY`.
    pub fn from_env() -> Result<Self, SummaryError> {
        let key = std::env::var(API_KEY_ENV).map_err(|_| SummaryError::Api {
            status: 401,
            message: format!("{API_KEY_ENV} not set"),
        })?;
        Self::new(key)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request_body<'a>(&'a self, request: &'a SummaryRequest, user: &'a str) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            max_tokens: u32::try_from(request.target_tokens).unwrap_or(u32::MAX),
            temperature: self.temperature,
        }
    }

    async fn send_once(&self, body: &ChatRequest<'_>) -> Result<String, SummaryError> {
        trace!(
            "Summary request payload size: {} bytes",
            serde_json::to_string(body).map_or(0, |s| s.len())
        );
        let start = Instant::now();

        let resp = self
            .client
            .post(OPENROUTER_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| self.transport_error(e))?;

        debug!(
            "Summary response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        parse_response(status.as_u16(), &text)
    }

    fn transport_error(&self, e: reqwest::Error) -> SummaryError {
        if e.is_timeout() {
            SummaryError::Timeout(self.timeout)
        } else {
            SummaryError::Http(e.to_string())
        }
    }
}

/// Turn an HTTP status and body into summary text.
fn parse_response(status: u16, text: &str) -> Result<String, SummaryError> {
    if !(200..300).contains(&status) {
        let message = serde_json::from_str::<RawChatResponse>(text)
            .ok()
            .and_then(|r| r.error)
            .map_or_else(|| text.to_string(), |e| e.message);
        return Err(SummaryError::Api { status, message });
    }

    let parsed: RawChatResponse = serde_json::from_str(text)
        .map_err(|e| SummaryError::Http(format!("failed to parse response: {e}")))?;

    if let Some(err) = parsed.error {
        return Err(SummaryError::Api {
            status: err.code.unwrap_or(status),
            message: err.message,
        });
    }

    if let Some(ref usage) = parsed.usage {
        debug!(
            "Summary token usage: prompt={}, completion={}",
            usage.prompt_tokens.unwrap_or(0),
            usage.completion_tokens.unwrap_or(0),
        );
    }

    parsed
        .choices
        .and_then(|c| c.into_iter().next())
        .and_then(|c| c.message.content)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or(SummaryError::Empty)
}

impl SummaryBackend for OpenRouterSummarizer {
    fn name(&self) -> &str {
        "openrouter"
    }

    fn summarize<'a>(&'a self, request: &'a SummaryRequest) -> SummaryFuture<'a> {
        Box::pin(async move {
            let user = request.user_message();
            let body = self.request_body(request, &user);
            debug!(
                "Summarizing {} items with {} (target {} tokens)",
                request.items.len(),
                self.model,
                request.target_tokens
            );
            self.retry.run(|| self.send_once(&body)).await
        })
    }
}
