//! Critic stage: reviews the draft for defects and inefficiencies.

use pipeline::{
    ConfigurationError, FieldType, PipelineError, SchemaContract, StageDefinition, StageInputs,
};
use serde::{Deserialize, Serialize};

/// State key of the critic's output.
pub const STAGE: &str = "critique";

/// Name of the schema sent to the backend.
pub const SCHEMA: &str = "critique";

/// Typed view of the critic's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Critique {
    /// Whether the draft has potential bugs or logic errors.
    pub has_errors: bool,
    /// Whether the draft is written efficiently.
    pub is_efficient: bool,
    /// Concrete, actionable improvements.
    pub suggested_improvements: Vec<String>,
    /// Summary of the review.
    pub critique_summary: String,
}

/// Output contract of the critic.
pub fn schema() -> Result<SchemaContract, ConfigurationError> {
    SchemaContract::builder(SCHEMA)
        .required(
            "has_errors",
            FieldType::Boolean,
            "Does the code have potential bugs or logic errors?",
        )
        .required(
            "is_efficient",
            FieldType::Boolean,
            "Is the code written in an efficient and optimal way?",
        )
        .required(
            "suggested_improvements",
            FieldType::string_array(),
            "Specific, actionable suggestions for improving the code.",
        )
        .required(
            "critique_summary",
            FieldType::String,
            "A summary of the critique.",
        )
        .build()
}

/// Builds the critic prompt from `draft.code`.
pub fn prompt(inputs: &StageInputs) -> Result<String, PipelineError> {
    let code = inputs.text("draft.code")?;
    Ok(format!(
        "You are an expert code reviewer and senior Python developer. Give the following \
         code a thorough critique.\n\
         \n\
         Analyse the code for:\n\
         1. **Bugs and defects:** are there potential runtime errors, logic flaws, or \
         unhandled edge cases?\n\
         2. **Efficiency and best practices:** is this the most efficient approach? Does it \
         follow standard Python conventions (PEP 8)?\n\
         \n\
         Provide a structured critique with specific, actionable suggestions.\n\
         \n\
         Code to review:\n\
         ```python\n\
         {code}\n\
         ```\n\
         \n\
         Respond in JSON with the fields `has_errors`, `is_efficient`, \
         `suggested_improvements` and `critique_summary`."
    ))
}

/// The critic stage definition.
pub fn definition() -> Result<StageDefinition, ConfigurationError> {
    StageDefinition::new(STAGE, &["draft.code"], schema()?, prompt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prompt_fences_the_draft_code() {
        let inputs = StageInputs::from_pairs([("draft.code", json!("def fib(n):\n    return n"))]);
        let prompt = prompt(&inputs).unwrap();
        assert!(prompt.contains("```python\ndef fib(n):\n    return n\n```"));
    }

    #[test]
    fn prompt_cannot_see_the_request() {
        let inputs = StageInputs::from_pairs([("request", json!("fib"))]);
        assert!(matches!(
            prompt(&inputs),
            Err(PipelineError::MissingInput { path }) if path == "draft.code"
        ));
    }

    #[test]
    fn schema_requires_every_critique_field() {
        let err = schema()
            .unwrap()
            .validate(&json!({ "has_errors": true }))
            .unwrap_err();
        assert_eq!(
            err.missing_fields,
            vec!["is_efficient", "suggested_improvements", "critique_summary"]
        );
    }
}
