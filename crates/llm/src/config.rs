//! Connection settings for an OpenAI-compatible endpoint.

use std::time::Duration;

use pipeline::{ModelId, DEFAULT_CALL_TIMEOUT};
use reqwest::Url;
use thiserror::Error;

/// Endpoint used when no base URL is configured.
pub const DEFAULT_BASE_URL: &str = "https://api.deepseek.com/v1";

/// Model used when none is configured.
pub const DEFAULT_MODEL: &str = "deepseek-chat";

/// Invalid backend settings, detected before any request is sent.
#[derive(Debug, Error)]
pub enum LlmConfigError {
    /// No API key, or a blank one.
    #[error("API key must not be empty")]
    MissingApiKey,

    /// Blank model identifier.
    #[error("model identifier must not be empty")]
    MissingModel,

    /// The base URL does not parse or is not http(s).
    #[error("invalid base URL '{url}': {reason}")]
    InvalidBaseUrl {
        /// The rejected value.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client")]
    Client(#[source] reqwest::Error),
}

/// Settings for [`crate::OpenAiCompatibleBackend`].
///
/// The API key is never printed by the `Debug` impl.
#[derive(Clone)]
pub struct LlmConfig {
    api_key: String,
    model: ModelId,
    base_url: Url,
    timeout: Duration,
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("base_url", &self.base_url.as_str())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl LlmConfig {
    /// Creates settings for the default endpoint and model.
    pub fn new(api_key: impl Into<String>) -> Result<Self, LlmConfigError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(LlmConfigError::MissingApiKey);
        }
        Ok(Self {
            api_key,
            model: ModelId::new(DEFAULT_MODEL).ok_or(LlmConfigError::MissingModel)?,
            base_url: parse_base_url(DEFAULT_BASE_URL)?,
            timeout: DEFAULT_CALL_TIMEOUT,
        })
    }

    /// Sets the model identifier.
    pub fn with_model(mut self, model: impl Into<String>) -> Result<Self, LlmConfigError> {
        self.model = ModelId::new(model).ok_or(LlmConfigError::MissingModel)?;
        Ok(self)
    }

    /// Sets the base URL; `/chat/completions` is appended to it.
    pub fn with_base_url(mut self, base_url: &str) -> Result<Self, LlmConfigError> {
        self.base_url = parse_base_url(base_url)?;
        Ok(self)
    }

    /// Sets the transport timeout applied when a request carries none.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The model identifier.
    pub fn model(&self) -> &ModelId {
        &self.model
    }

    /// The configured base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Default transport timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Full URL of the chat-completions endpoint.
    pub fn completions_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.base_url.as_str().trim_end_matches('/')
        )
    }
}

fn parse_base_url(raw: &str) -> Result<Url, LlmConfigError> {
    let url = Url::parse(raw.trim()).map_err(|e| LlmConfigError::InvalidBaseUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(LlmConfigError::InvalidBaseUrl {
            url: raw.to_string(),
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}
