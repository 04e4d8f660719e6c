//! Error and retry-policy types for the pipeline domain.
//!
//! [`PipelineError`] is the single failure taxonomy a stage can produce.
//! [`BackendError`] is what an [`crate::LlmBackend`] implementation returns;
//! the invocation adapter folds it into [`PipelineError`]. [`RunFailure`] is the
//! tagged failure handed to the runner's caller: which stage failed, why, and
//! the state accumulated before it.
//!
//! [`RetryPolicy`] is a cross-cutting concern: every backend error can say
//! whether re-issuing the same call could succeed.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{PipelineState, RunId, SchemaError, StageName};

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is safe to retry and, if so, after what delay.
///
/// Returned by backend error types so the runner can decide whether a retry
/// is permitted under the caller's [`crate::RetryConfig`].
///
/// - `Retryable` errors: connection failures, timeouts, HTTP 429 and 5xx.
/// - `NonRetryable` errors: rejected credentials, malformed requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The operation may be retried.
    ///
    /// `after` optionally specifies the minimum delay before retrying (e.g.
    /// derived from a `Retry-After` response header).
    Retryable {
        /// Minimum back-off before the next attempt. `None` means apply the
        /// caller's own back-off schedule.
        after: Option<Duration>,
    },
    /// The operation must not be retried.
    NonRetryable,
}

impl RetryPolicy {
    /// Returns `true` for [`RetryPolicy::Retryable`].
    pub fn is_retryable(&self) -> bool {
        matches!(self, RetryPolicy::Retryable { .. })
    }
}

// ---------------------------------------------------------------------------
// Backend errors
// ---------------------------------------------------------------------------

/// Failure reported by a model backend.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    /// The backend could not be reached or refused the request (network
    /// failure, authentication failure, server error).
    #[error("model backend unavailable: {message}")]
    Unavailable {
        /// Human-readable description, including the HTTP status if any.
        message: String,
        /// Whether re-issuing the call may succeed.
        retry: RetryPolicy,
    },

    /// The call did not complete within the configured deadline.
    #[error("model backend call timed out after {}ms", .after.as_millis())]
    Timeout {
        /// The deadline that was exceeded.
        after: Duration,
    },

    /// The backend answered, but the response envelope carried no text to
    /// decode (e.g. an empty `choices` array).
    #[error("model backend protocol error: {message}")]
    Protocol {
        /// Description of what was missing from the envelope.
        message: String,
    },
}

impl BackendError {
    /// Returns the [`RetryPolicy`] that applies to this error.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            BackendError::Unavailable { retry, .. } => retry.clone(),
            BackendError::Timeout { .. } => RetryPolicy::Retryable { after: None },
            BackendError::Protocol { .. } => RetryPolicy::NonRetryable,
        }
    }
}

// ---------------------------------------------------------------------------
// Stage-level errors
// ---------------------------------------------------------------------------

/// Every way a stage, and therefore a run, can fail.
///
/// There is no "partial success" variant: either a stage's output validates
/// completely or the run fails at that stage.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    /// Network or authentication failure reaching the model.
    #[error(transparent)]
    BackendUnavailable(BackendError),

    /// The backend call exceeded its deadline.
    #[error("model call timed out after {}ms", .after.as_millis())]
    Timeout {
        /// The deadline that was exceeded.
        after: Duration,
    },

    /// The backend response is not well-formed JSON.
    #[error("model response is not valid JSON: {reason}")]
    Decode {
        /// The raw text returned by the backend.
        raw_text: String,
        /// Parser diagnostic.
        reason: String,
    },

    /// Well-formed JSON that does not conform to the stage's schema.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// The run was cancelled cooperatively before the stage started.
    #[error("cancellation requested")]
    CancellationRequested,

    /// A declared stage input could not be resolved from the state.
    ///
    /// Sequential execution makes this unreachable for a correctly ordered
    /// runner; it is reported instead of panicking when stages are misordered.
    #[error("stage input '{path}' is not available in the pipeline state")]
    MissingInput {
        /// The declared input path (e.g. `"draft.code"`).
        path: String,
    },

    /// A stage tried to record output under a key that already has output.
    #[error("stage '{stage}' already has output in this pipeline state")]
    DuplicateStageOutput {
        /// The stage whose output would have been overwritten.
        stage: StageName,
    },

    /// A stage returned an update keyed by a name other than its own.
    #[error("stage '{expected}' returned output for '{actual}'")]
    ForeignStageOutput {
        /// The stage that ran.
        expected: StageName,
        /// The key its update targeted.
        actual: StageName,
    },
}

impl PipelineError {
    /// Whether the runner may retry the stage after this error.
    ///
    /// Decode and schema failures are never retried: a wrong-shaped answer is
    /// a hard failure.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            PipelineError::BackendUnavailable(err) => err.retry_policy(),
            PipelineError::Timeout { .. } => RetryPolicy::Retryable { after: None },
            _ => RetryPolicy::NonRetryable,
        }
    }
}

impl From<BackendError> for PipelineError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Timeout { after } => PipelineError::Timeout { after },
            other => PipelineError::BackendUnavailable(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Run-level errors
// ---------------------------------------------------------------------------

/// Tagged failure returned by the runner when a run ends in `FAILED`.
#[derive(Debug, Clone, Error)]
#[error("run {run_id} failed at stage '{stage}': {error}")]
pub struct RunFailure {
    /// The run that failed.
    pub run_id: RunId,
    /// The stage that failed, or for cancellation, the stage that would have
    /// run next.
    pub stage: StageName,
    /// Why the stage failed.
    #[source]
    pub error: PipelineError,
    /// State accumulated by every stage that completed before the failure.
    pub partial: PipelineState,
}

impl RunFailure {
    /// Returns `true` if the run stopped because cancellation was requested.
    pub fn is_cancellation(&self) -> bool {
        matches!(self.error, PipelineError::CancellationRequested)
    }
}

/// Invalid configuration detected while constructing pipeline components.
///
/// Produced at construction time; a runner never starts with an invalid
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Configuration error: {message}")]
pub struct ConfigurationError {
    /// Description of the configuration problem.
    pub message: String,
}

impl ConfigurationError {
    /// Creates a [`ConfigurationError`] from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
