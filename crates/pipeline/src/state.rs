//! The accumulating record threaded through a run.
//!
//! A [`PipelineState`] is created once per run from the caller's request and
//! grows by exactly one stage output per completed stage. Updates never happen
//! in place: [`PipelineState::with_update`] returns a new state that shares
//! the earlier outputs, so every intermediate snapshot stays inspectable after
//! the run moves on.

use std::sync::Arc;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::{PipelineError, RunId, StageName, StructuredResult};

/// Key under which the original request is exposed to stage inputs and in the
/// serialised state. No stage may use it as its name.
pub const REQUEST_KEY: &str = "request";

/// Key holding the run identifier in the serialised state. Reserved like
/// [`REQUEST_KEY`].
pub const RUN_ID_KEY: &str = "run_id";

/// Returns `true` if `name` collides with a top-level key of the serialised
/// state.
pub(crate) fn is_reserved_key(name: &str) -> bool {
    name == REQUEST_KEY || name == RUN_ID_KEY
}

/// The single field a stage contributes to the state.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialUpdate {
    /// The stage (and state key) that owns the result.
    pub stage: StageName,
    /// The validated output.
    pub result: StructuredResult,
}

impl PartialUpdate {
    /// Creates an update for `stage`.
    pub fn new(stage: StageName, result: StructuredResult) -> Self {
        Self { stage, result }
    }
}

/// One recorded stage output.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutput {
    /// Stage that produced the result.
    pub stage: StageName,
    /// Validated result, shared between every snapshot that contains it.
    pub result: Arc<StructuredResult>,
}

/// Request plus every stage output produced so far, in execution order.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineState {
    run_id: RunId,
    request: Arc<str>,
    outputs: Vec<StageOutput>,
}

impl PipelineState {
    /// Creates the initial state of a new run with a fresh [`RunId`].
    pub fn new(request: impl Into<String>) -> Self {
        Self::with_run_id(RunId::new_random(), request)
    }

    /// Creates the initial state of a run with a caller-chosen id.
    pub fn with_run_id(run_id: RunId, request: impl Into<String>) -> Self {
        Self {
            run_id,
            request: Arc::from(request.into()),
            outputs: Vec::new(),
        }
    }

    /// The run this state belongs to.
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// The caller's original request. Never changes during a run.
    pub fn request(&self) -> &str {
        &self.request
    }

    /// Output recorded for `stage`, if that stage has completed.
    pub fn get(&self, stage: &str) -> Option<&StructuredResult> {
        self.outputs
            .iter()
            .find(|o| o.stage.as_str() == stage)
            .map(|o| o.result.as_ref())
    }

    /// Whether `stage` has recorded output.
    pub fn contains(&self, stage: &str) -> bool {
        self.get(stage).is_some()
    }

    /// Every recorded output, in the order the stages completed.
    pub fn outputs(&self) -> &[StageOutput] {
        &self.outputs
    }

    /// Number of completed stages.
    pub fn completed_stages(&self) -> usize {
        self.outputs.len()
    }

    /// Returns a new state with `update` appended, leaving `self` untouched.
    ///
    /// Fails with [`PipelineError::DuplicateStageOutput`] if the stage already
    /// has output or its name is a reserved key; earlier results are never
    /// overwritten.
    pub fn with_update(&self, update: PartialUpdate) -> Result<PipelineState, PipelineError> {
        if is_reserved_key(update.stage.as_str()) || self.contains(update.stage.as_str()) {
            return Err(PipelineError::DuplicateStageOutput {
                stage: update.stage,
            });
        }
        let mut outputs = Vec::with_capacity(self.outputs.len() + 1);
        outputs.extend(self.outputs.iter().cloned());
        outputs.push(StageOutput {
            stage: update.stage,
            result: Arc::new(update.result),
        });
        Ok(PipelineState {
            run_id: self.run_id,
            request: Arc::clone(&self.request),
            outputs,
        })
    }

    /// Resolves an input path against the state.
    ///
    /// Supported paths: `request`, `<stage>` (the whole output as a JSON
    /// object) and `<stage>.<field>`.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        if path == REQUEST_KEY {
            return Some(Value::String(self.request.to_string()));
        }
        match path.split_once('.') {
            Some((stage, field)) => self.get(stage)?.get(field).cloned(),
            None => self.get(path).map(StructuredResult::to_value),
        }
    }

    /// Serialises the state as a JSON mapping (see [`Serialize`] impl).
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Serialises as `{"run_id": …, "request": …, "<stage>": {…}, …}`, the mapping a
/// reporting layer consumes.
impl Serialize for PipelineState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.outputs.len() + 2))?;
        map.serialize_entry(RUN_ID_KEY, &self.run_id)?;
        map.serialize_entry(REQUEST_KEY, self.request.as_ref())?;
        for output in &self.outputs {
            map.serialize_entry(output.stage.as_str(), output.result.as_ref())?;
        }
        map.end()
    }
}
