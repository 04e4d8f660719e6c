//! Schema-enforced model invocation.
//!
//! [`ModelInvoker`] is the only path from a stage to the backend. It sends the
//! prompt with the stage's schema descriptor, decodes the raw reply as JSON and
//! validates it against the [`SchemaContract`]. A reply that does not decode or
//! does not validate is a hard failure; nothing is coerced or repaired beyond
//! removing a surrounding Markdown code fence.
//!
//! The invoker performs one round trip per call: no retries (that policy
//! belongs to the runner) and no caching (outputs are sampled at a non-zero
//! temperature).

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    GenerationRequest, LlmBackend, PipelineError, SchemaContract, StructuredResult, Temperature,
};

/// Default per-call deadline.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Wraps an [`LlmBackend`] with decoding and schema validation.
///
/// Constructed once by the composition root and shared (via `Arc`) with the
/// runner and every stage.
#[derive(Clone)]
pub struct ModelInvoker {
    backend: Arc<dyn LlmBackend>,
    temperature: Temperature,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for ModelInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelInvoker")
            .field("temperature", &self.temperature)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ModelInvoker {
    /// Creates an invoker with the default temperature and call timeout.
    pub fn new(backend: Arc<dyn LlmBackend>) -> Self {
        Self {
            backend,
            temperature: Temperature::default(),
            timeout: Some(DEFAULT_CALL_TIMEOUT),
        }
    }

    /// Sets the sampling temperature.
    pub fn with_temperature(mut self, temperature: Temperature) -> Self {
        self.temperature = temperature;
        self
    }

    /// Sets the per-call deadline; `None` waits indefinitely.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Configured temperature.
    pub fn temperature(&self) -> Temperature {
        self.temperature
    }

    /// Configured per-call deadline.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Sends `prompt` to the backend and returns the validated result.
    #[tracing::instrument(
        name = "invoke",
        skip_all,
        fields(schema = %schema.name(), prompt_len = prompt.len())
    )]
    pub async fn invoke(
        &self,
        prompt: &str,
        schema: &SchemaContract,
    ) -> Result<StructuredResult, PipelineError> {
        let request = GenerationRequest {
            prompt: prompt.to_string(),
            schema: schema.descriptor(),
            temperature: self.temperature,
            timeout: self.timeout,
        };

        let raw = match self.timeout {
            Some(after) => tokio::time::timeout(after, self.backend.generate(&request))
                .await
                .map_err(|_| PipelineError::Timeout { after })??,
            None => self.backend.generate(&request).await?,
        };
        debug!(response_len = raw.len(), "backend responded");

        let value = decode(&raw)?;
        schema.validate(&value).map_err(|err| {
            warn!(error = %err, "response failed schema validation");
            PipelineError::Schema(err)
        })
    }
}

/// Parses backend text as JSON, stripping one surrounding code fence.
fn decode(raw: &str) -> Result<Value, PipelineError> {
    serde_json::from_str(strip_code_fence(raw)).map_err(|err| {
        warn!(error = %err, "response is not valid JSON");
        PipelineError::Decode {
            raw_text: raw.to_string(),
            reason: err.to_string(),
        }
    })
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(body) = rest.strip_suffix("```") else {
        return trimmed;
    };
    // Drop an info string such as `json` on the opening fence line.
    match body.split_once('\n') {
        Some((info, inner)) if !info.trim_start().starts_with('{') => inner.trim(),
        _ => body.trim(),
    }
}
