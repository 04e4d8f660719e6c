//! OpenAI-compatible chat-completions backend.

use std::time::Duration;

use async_trait::async_trait;
use pipeline::{BackendError, GenerationRequest, LlmBackend, RetryPolicy, SchemaName};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{LlmConfig, LlmConfigError};

/// Upper bound on how much of an error body is kept in messages.
const ERROR_BODY_LIMIT: usize = 512;

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    temperature: f64,
    response_format: ResponseFormat<'a>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    json_schema: JsonSchemaFormat<'a>,
}

#[derive(Debug, Serialize)]
struct JsonSchemaFormat<'a> {
    name: &'a SchemaName,
    schema: &'a Value,
    strict: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: Option<String>,
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// [`LlmBackend`] that POSTs to `{base_url}/chat/completions` with bearer auth
/// and a `json_schema` response format.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleBackend {
    config: LlmConfig,
    client: Client,
    endpoint: String,
}

impl OpenAiCompatibleBackend {
    /// Builds the backend and its HTTP client.
    pub fn new(config: LlmConfig) -> Result<Self, LlmConfigError> {
        let client = Client::builder()
            .build()
            .map_err(LlmConfigError::Client)?;
        let endpoint = config.completions_url();
        Ok(Self {
            config,
            client,
            endpoint,
        })
    }

    /// The settings this backend was built with.
    pub fn config(&self) -> &LlmConfig {
        &self.config
    }
}

#[async_trait]
impl LlmBackend for OpenAiCompatibleBackend {
    #[tracing::instrument(
        name = "llm.generate",
        skip_all,
        fields(model = %self.config.model(), schema = %request.schema.name)
    )]
    async fn generate(&self, request: &GenerationRequest) -> Result<String, BackendError> {
        let timeout = request.timeout.unwrap_or_else(|| self.config.timeout());
        let body = ChatRequest {
            model: self.config.model().as_str(),
            messages: [ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            temperature: request.temperature.as_f64(),
            response_format: ResponseFormat {
                kind: "json_schema",
                json_schema: JsonSchemaFormat {
                    name: &request.schema.name,
                    schema: &request.schema.schema,
                    strict: request.schema.strict,
                },
            },
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.config.api_key())
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;

        let status = response.status();
        debug!(status = status.as_u16(), "model backend responded");
        if !status.is_success() {
            let retry_after = retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            let err = status_error(status, retry_after, &text);
            warn!(status = status.as_u16(), error = %err, "model backend rejected request");
            return Err(err);
        }

        let envelope: ChatResponse = response
            .json()
            .await
            .map_err(|e| transport_error(e, timeout))?;
        envelope
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| BackendError::Protocol {
                message: "response carried no choices[0].message.content".to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Maps a reqwest failure that happened before a status was available, or
/// while reading the body.
fn transport_error(err: reqwest::Error, timeout: Duration) -> BackendError {
    if err.is_timeout() {
        return BackendError::Timeout { after: timeout };
    }
    if err.is_decode() {
        return BackendError::Protocol {
            message: format!("malformed response envelope: {err}"),
        };
    }
    BackendError::Unavailable {
        message: format!("request failed: {err}"),
        retry: RetryPolicy::Retryable { after: None },
    }
}

/// Maps a non-success HTTP status. 429 and 5xx may be retried; every other
/// status (401, 403, 400, 404, ...) is final.
fn status_error(status: StatusCode, retry_after: Option<Duration>, body: &str) -> BackendError {
    let retry = if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        RetryPolicy::Retryable { after: retry_after }
    } else {
        RetryPolicy::NonRetryable
    };
    let body: String = body.trim().chars().take(ERROR_BODY_LIMIT).collect();
    let message = if body.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {body}")
    };
    BackendError::Unavailable { message, retry }
}

/// Reads a `Retry-After` header given in whole seconds. HTTP-date values are
/// ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
