//! Scripted backend for tests.
//!
//! Enabled for this crate's own tests and, through the `test-support` feature,
//! for downstream crates' tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::{BackendError, GenerationRequest, LlmBackend};

/// Backend that replays queued responses per schema name and records every
/// request it receives.
#[derive(Debug, Default)]
pub struct ScriptedBackend {
    responses: Mutex<HashMap<String, VecDeque<Result<String, BackendError>>>>,
    requests: Mutex<Vec<GenerationRequest>>,
    delay: Option<Duration>,
}

impl ScriptedBackend {
    /// Creates a backend with no scripted responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps for `delay` before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queues a raw text response for calls made with schema `schema`.
    pub fn respond(self, schema: &str, text: impl Into<String>) -> Self {
        self.push(schema, Ok(text.into()));
        self
    }

    /// Queues a JSON response for calls made with schema `schema`.
    pub fn respond_json(self, schema: &str, value: serde_json::Value) -> Self {
        self.respond(schema, value.to_string())
    }

    /// Queues a failure for calls made with schema `schema`.
    pub fn fail(self, schema: &str, error: BackendError) -> Self {
        self.push(schema, Err(error));
        self
    }

    fn push(&self, schema: &str, response: Result<String, BackendError>) {
        if let Ok(mut responses) = self.responses.lock() {
            responses
                .entry(schema.to_string())
                .or_default()
                .push_back(response);
        }
    }

    /// Number of calls made with schema `schema`.
    pub fn calls_for(&self, schema: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.schema.name.as_str() == schema)
            .count()
    }

    /// Total number of calls.
    pub fn total_calls(&self) -> usize {
        self.requests().len()
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, BackendError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .responses
            .lock()
            .ok()
            .and_then(|mut r| r.get_mut(request.schema.name.as_str())?.pop_front());
        next.unwrap_or_else(|| {
            Err(BackendError::Protocol {
                message: format!("no scripted response for schema '{}'", request.schema.name),
            })
        })
    }
}
