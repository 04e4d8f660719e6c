//! Port to the text-generation backend.
//!
//! The pipeline depends only on [`LlmBackend`]; concrete providers live in
//! infrastructure crates (see the `llm` crate for the OpenAI-compatible HTTP
//! implementation). Tests supply scripted implementations.

use std::time::Duration;

use async_trait::async_trait;

use crate::{BackendError, SchemaDescriptor, Temperature};

/// Everything a backend needs for one generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    /// Prompt text sent as the user message.
    pub prompt: String,
    /// Schema the backend should constrain its output to.
    pub schema: SchemaDescriptor,
    /// Sampling temperature.
    pub temperature: Temperature,
    /// Deadline for the call, if any. Backends should pass this to their
    /// transport; the invocation adapter enforces it as well.
    pub timeout: Option<Duration>,
}

/// A text-generation capability: prompt plus schema in, raw text out.
///
/// Implementations perform exactly one round trip per call. They do not retry,
/// cache, or parse the returned text.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Generates raw text for `request`.
    async fn generate(&self, request: &GenerationRequest) -> Result<String, BackendError>;
}
