//! Reflect stage implementations.
//!
//! This crate provides the three stages of the reflection pipeline and the
//! typed view of its state:
//!
//! | Stage | State key | Reads | Schema |
//! |-------|-----------|-------|--------|
//! | [`generator`] | `draft` | `request` | `draft_code` |
//! | [`critic`] | `critique` | `draft.code` | `critique` |
//! | [`refiner`] | `refined` | `draft.code`, `critique` | `refined_code` |
//!
//! ## Architectural Layer
//!
//! **Orchestration layer.** Stages are plain [`pipeline::StageDefinition`]s:
//! a schema contract plus a prompt builder. Execution, validation, and failure
//! handling all belong to the [`pipeline`] crate.

use std::sync::Arc;

use pipeline::{ConfigurationError, ModelInvoker, PipelineRunner, PipelineState, StageDefinition};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod critic;
pub mod generator;
pub mod refiner;

pub use critic::Critique;
pub use generator::Draft;
pub use refiner::Refinement;

/// The reflection stages in execution order.
pub fn reflection_stages() -> Result<Vec<StageDefinition>, ConfigurationError> {
    Ok(vec![
        generator::definition()?,
        critic::definition()?,
        refiner::definition()?,
    ])
}

/// A runner over [`reflection_stages`] sharing `invoker`.
pub fn reflection_runner(invoker: Arc<ModelInvoker>) -> Result<PipelineRunner, ConfigurationError> {
    PipelineRunner::from_definitions(reflection_stages()?, invoker)
}

/// A stage output in the state could not be read as its typed record.
#[derive(Debug, Error)]
#[error("output of stage '{stage}' does not match its record type")]
pub struct ReflectionStateError {
    /// State key of the offending output.
    pub stage: &'static str,
    /// Deserialisation failure.
    #[source]
    pub source: serde_json::Error,
}

/// Typed record of a reflection run: one optional field per stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReflectionState {
    /// The caller's request.
    pub request: String,
    /// Generator output.
    pub draft: Option<Draft>,
    /// Critic output.
    pub critique: Option<Critique>,
    /// Refiner output.
    pub refined: Option<Refinement>,
}

impl ReflectionState {
    /// Whether all three stages have produced output.
    pub fn is_complete(&self) -> bool {
        self.draft.is_some() && self.critique.is_some() && self.refined.is_some()
    }
}

impl TryFrom<&PipelineState> for ReflectionState {
    type Error = ReflectionStateError;

    fn try_from(state: &PipelineState) -> Result<Self, Self::Error> {
        Ok(Self {
            request: state.request().to_string(),
            draft: typed(state, generator::STAGE)?,
            critique: typed(state, critic::STAGE)?,
            refined: typed(state, refiner::STAGE)?,
        })
    }
}

fn typed<T: serde::de::DeserializeOwned>(
    state: &PipelineState,
    stage: &'static str,
) -> Result<Option<T>, ReflectionStateError> {
    state
        .get(stage)
        .map(|result| result.deserialize_into())
        .transpose()
        .map_err(|source| ReflectionStateError { stage, source })
}
