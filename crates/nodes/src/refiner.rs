//! Refiner stage: rewrites the draft so it addresses the critique.

use pipeline::{
    ConfigurationError, FieldType, PipelineError, SchemaContract, StageDefinition, StageInputs,
};
use serde::{Deserialize, Serialize};

/// State key of the refiner's output.
pub const STAGE: &str = "refined";

/// Name of the schema sent to the backend.
pub const SCHEMA: &str = "refined_code";

/// Typed view of the refiner's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Refinement {
    /// The improved code.
    pub refined_code: String,
    /// What changed relative to the draft, and why.
    pub refinement_summary: String,
}

/// Output contract of the refiner.
pub fn schema() -> Result<SchemaContract, ConfigurationError> {
    SchemaContract::builder(SCHEMA)
        .required(
            "refined_code",
            FieldType::String,
            "The final, improved Python code.",
        )
        .required(
            "refinement_summary",
            FieldType::String,
            "A summary of the changes made based on the critique.",
        )
        .build()
}

/// Builds the refiner prompt from `draft.code` and the serialised critique.
pub fn prompt(inputs: &StageInputs) -> Result<String, PipelineError> {
    let code = inputs.text("draft.code")?;
    let critique = inputs.text("critique")?;
    Ok(format!(
        "You are an expert Python programmer tasked with refining a piece of code based \
         on a critique.\n\
         \n\
         Your goal is to rewrite the original code, implementing every improvement the \
         critique suggests.\n\
         \n\
         **Original code:**\n\
         ```python\n\
         {code}\n\
         ```\n\
         \n\
         **Critique and suggestions:**\n\
         {critique}\n\
         \n\
         Provide the final refined code and a summary of the changes you made.\n\
         \n\
         Respond in JSON with the fields `refined_code` and `refinement_summary`."
    ))
}

/// The refiner stage definition.
pub fn definition() -> Result<StageDefinition, ConfigurationError> {
    StageDefinition::new(STAGE, &["draft.code", "critique"], schema()?, prompt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prompt_includes_code_and_pretty_printed_critique() {
        let inputs = StageInputs::from_pairs([
            ("draft.code", json!("def fib(n): ...")),
            (
                "critique",
                json!({ "has_errors": false, "suggested_improvements": ["memoize"] }),
            ),
        ]);
        let prompt = prompt(&inputs).unwrap();
        assert!(prompt.contains("```python\ndef fib(n): ...\n```"));
        assert!(prompt.contains("\"suggested_improvements\": [\n    \"memoize\"\n  ]"));
    }

    #[test]
    fn definition_reads_draft_code_and_critique() {
        let definition = definition().unwrap();
        assert_eq!(definition.name().as_str(), "refined");
        assert_eq!(
            definition.inputs(),
            ["draft.code".to_string(), "critique".to_string()]
        );
    }
}
