//! The stage (node) contract.
//!
//! A [`Stage`] maps the current [`PipelineState`] to a [`PartialUpdate`]
//! holding exactly the one field it owns. [`LlmStage`] is the model-backed
//! implementation driven by a [`StageDefinition`]: it resolves the declared
//! input paths into a [`StageInputs`] view, builds the prompt from that view
//! only, and delegates to the shared [`ModelInvoker`].

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::state::is_reserved_key;
use crate::{
    ConfigurationError, ModelInvoker, PartialUpdate, PipelineError, PipelineState,
    SchemaContract, StageName,
};

/// Builds a prompt from a stage's resolved inputs.
pub type PromptFn = Arc<dyn Fn(&StageInputs) -> Result<String, PipelineError> + Send + Sync>;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// The subset of a [`PipelineState`] a stage declared it reads.
///
/// Prompt functions only ever see this view; asking it for an undeclared path
/// fails with [`PipelineError::MissingInput`].
#[derive(Debug, Clone, PartialEq)]
pub struct StageInputs {
    values: Vec<(String, Value)>,
}

impl StageInputs {
    /// Resolves every path in `paths` against `state`.
    pub fn resolve(state: &PipelineState, paths: &[String]) -> Result<Self, PipelineError> {
        let values = paths
            .iter()
            .map(|path| {
                state
                    .lookup(path)
                    .map(|value| (path.clone(), value))
                    .ok_or_else(|| PipelineError::MissingInput { path: path.clone() })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { values })
    }

    /// Builds inputs directly from path/value pairs.
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Self {
            values: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Raw value of a declared input.
    pub fn get(&self, path: &str) -> Result<&Value, PipelineError> {
        self.values
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, v)| v)
            .ok_or_else(|| PipelineError::MissingInput {
                path: path.to_string(),
            })
    }

    /// A declared input rendered for a prompt: strings verbatim, everything
    /// else as pretty-printed JSON.
    pub fn text(&self, path: &str) -> Result<String, PipelineError> {
        Ok(match self.get(path)? {
            Value::String(s) => s.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        })
    }
}

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// Immutable, process-wide description of one model-backed stage.
#[derive(Clone)]
pub struct StageDefinition {
    name: StageName,
    inputs: Vec<String>,
    schema: Arc<SchemaContract>,
    prompt: PromptFn,
}

impl std::fmt::Debug for StageDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageDefinition")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("schema", &self.schema.name())
            .finish_non_exhaustive()
    }
}

impl StageDefinition {
    /// Creates a definition.
    ///
    /// `inputs` are state paths (`request`, `<stage>` or `<stage>.<field>`).
    /// Fails if the name is blank or reserved, or an input path is blank.
    pub fn new<F>(
        name: &str,
        inputs: &[&str],
        schema: SchemaContract,
        prompt: F,
    ) -> Result<Self, ConfigurationError>
    where
        F: Fn(&StageInputs) -> Result<String, PipelineError> + Send + Sync + 'static,
    {
        let name = StageName::new(name)
            .ok_or_else(|| ConfigurationError::new("stage name must not be empty"))?;
        if is_reserved_key(name.as_str()) || name.as_str().contains('.') {
            return Err(ConfigurationError::new(format!(
                "'{name}' is not a valid stage name"
            )));
        }
        if inputs.iter().any(|path| path.trim().is_empty()) {
            return Err(ConfigurationError::new(format!(
                "stage '{name}' declares an empty input path"
            )));
        }
        Ok(Self {
            name,
            inputs: inputs.iter().map(|p| p.to_string()).collect(),
            schema: Arc::new(schema),
            prompt: Arc::new(prompt),
        })
    }

    /// Stage name, also the state key of its output.
    pub fn name(&self) -> &StageName {
        &self.name
    }

    /// Declared input paths.
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    /// Output contract.
    pub fn schema(&self) -> &SchemaContract {
        &self.schema
    }

    /// Builds the prompt for `state` from the declared inputs only.
    pub fn build_prompt(&self, state: &PipelineState) -> Result<String, PipelineError> {
        let inputs = StageInputs::resolve(state, &self.inputs)?;
        (self.prompt)(&inputs)
    }
}

// ---------------------------------------------------------------------------
// Stage contract
// ---------------------------------------------------------------------------

/// One step of a pipeline.
///
/// Implementations must be referentially transparent given fixed inputs and a
/// fixed backend, and must return an update for their own name only.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Name of the stage and key of the field it produces.
    fn name(&self) -> &StageName;

    /// Produces this stage's update from the current state.
    async fn run(&self, state: &PipelineState) -> Result<PartialUpdate, PipelineError>;
}

/// A [`Stage`] backed by a [`StageDefinition`] and a [`ModelInvoker`].
#[derive(Debug, Clone)]
pub struct LlmStage {
    definition: Arc<StageDefinition>,
    invoker: Arc<ModelInvoker>,
}

impl LlmStage {
    /// Binds a definition to the shared invoker.
    pub fn new(definition: Arc<StageDefinition>, invoker: Arc<ModelInvoker>) -> Self {
        Self {
            definition,
            invoker,
        }
    }

    /// The definition this stage runs.
    pub fn definition(&self) -> &StageDefinition {
        &self.definition
    }
}

#[async_trait]
impl Stage for LlmStage {
    fn name(&self) -> &StageName {
        self.definition.name()
    }

    async fn run(&self, state: &PipelineState) -> Result<PartialUpdate, PipelineError> {
        let prompt = self.definition.build_prompt(state)?;
        debug!(stage = %self.definition.name(), prompt_len = prompt.len(), "prompt built");
        let result = self.invoker.invoke(&prompt, self.definition.schema()).await?;
        Ok(PartialUpdate::new(self.definition.name().clone(), result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedBackend;
    use crate::FieldType;
    use serde_json::json;

    fn echo_definition() -> StageDefinition {
        let schema = SchemaContract::builder("echo")
            .required("text", FieldType::String, "")
            .build()
            .unwrap();
        StageDefinition::new("echo", &["request"], schema, |inputs| {
            Ok(format!("Repeat: {}", inputs.text("request")?))
        })
        .unwrap()
    }

    #[test]
    fn inputs_only_expose_declared_paths() {
        let inputs = StageInputs::from_pairs([("draft.code", json!("x = 1"))]);
        assert_eq!(inputs.text("draft.code").unwrap(), "x = 1");
        assert_eq!(
            inputs.get("request").unwrap_err(),
            PipelineError::MissingInput {
                path: "request".into()
            }
        );
    }

    #[test]
    fn non_string_inputs_render_as_pretty_json() {
        let inputs = StageInputs::from_pairs([("critique", json!({ "has_errors": true }))]);
        assert_eq!(inputs.text("critique").unwrap(), "{\n  \"has_errors\": true\n}");
    }

    #[test]
    fn resolving_an_absent_path_fails() {
        let state = PipelineState::new("hi");
        let err = StageInputs::resolve(&state, &["draft.code".to_string()]).unwrap_err();
        assert!(matches!(err, PipelineError::MissingInput { path } if path == "draft.code"));
    }

    #[test]
    fn definition_rejects_reserved_names() {
        let schema = || {
            SchemaContract::builder("s")
                .required("a", FieldType::String, "")
                .build()
                .unwrap()
        };
        let prompt = |_: &StageInputs| Ok(String::new());
        assert!(StageDefinition::new("request", &[], schema(), prompt).is_err());
        assert!(StageDefinition::new("run_id", &[], schema(), prompt).is_err());
        assert!(StageDefinition::new("a.b", &[], schema(), prompt).is_err());
        assert!(StageDefinition::new("", &[], schema(), prompt).is_err());
        assert!(StageDefinition::new("ok", &[" "], schema(), prompt).is_err());
    }

    #[tokio::test]
    async fn llm_stage_returns_only_its_own_field() {
        let backend = Arc::new(ScriptedBackend::new().respond_json("echo", json!({ "text": "hi" })));
        let invoker = Arc::new(ModelInvoker::new(backend.clone()));
        let stage = LlmStage::new(Arc::new(echo_definition()), invoker);

        let update = stage.run(&PipelineState::new("hi")).await.unwrap();

        assert_eq!(update.stage.as_str(), "echo");
        assert_eq!(update.result.get_str("text"), Some("hi"));
        assert_eq!(backend.requests()[0].prompt, "Repeat: hi");
    }
}
