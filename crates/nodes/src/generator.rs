//! Generator stage: writes the initial draft for the user's request.

use pipeline::{
    ConfigurationError, FieldType, PipelineError, SchemaContract, StageDefinition, StageInputs,
};
use serde::{Deserialize, Serialize};

/// State key of the generator's output.
pub const STAGE: &str = "draft";

/// Name of the schema sent to the backend.
pub const SCHEMA: &str = "draft_code";

/// Typed view of the generator's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draft {
    /// Code solving the request.
    pub code: String,
    /// Short explanation of how the code works.
    pub explanation: String,
}

/// Output contract of the generator.
pub fn schema() -> Result<SchemaContract, ConfigurationError> {
    SchemaContract::builder(SCHEMA)
        .required(
            "code",
            FieldType::String,
            "Python code that solves the user's request.",
        )
        .required(
            "explanation",
            FieldType::String,
            "A brief explanation of how the code works.",
        )
        .build()
}

/// Builds the generator prompt from `request`.
pub fn prompt(inputs: &StageInputs) -> Result<String, PipelineError> {
    let request = inputs.text("request")?;
    Ok(format!(
        "You are an expert Python programmer. Write a Python function that solves the \
         following request.\n\
         Provide a simple, clear implementation and an explanation.\n\
         \n\
         Request: {request}\n\
         \n\
         Respond in JSON with the fields `code` and `explanation`."
    ))
}

/// The generator stage definition.
pub fn definition() -> Result<StageDefinition, ConfigurationError> {
    StageDefinition::new(STAGE, &["request"], schema()?, prompt)
}
