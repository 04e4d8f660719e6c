//! Schema contracts: the declared shape of a stage's output.
//!
//! A [`SchemaContract`] is defined once per stage at configuration time and
//! shared read-only across runs. It does two jobs:
//!
//! 1. [`SchemaContract::validate`] checks an untyped JSON value and, on
//!    success, produces the only way to obtain a [`StructuredResult`].
//! 2. [`SchemaContract::descriptor`] renders the contract as a JSON-Schema
//!    document the backend can use for schema-guided decoding.
//!
//! Validation is pure: it never mutates or coerces the input, and it reports
//! every violation in one pass. The descriptor is compiled once with
//! `jsonschema` when the contract is built; validation runs that compiled
//! validator and sorts its errors into a [`SchemaError`].

use std::collections::HashSet;
use std::sync::Arc;

use jsonschema::error::ValidationErrorKind;
use jsonschema::Validator;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{ConfigurationError, SchemaName};

// ---------------------------------------------------------------------------
// Field types
// ---------------------------------------------------------------------------

/// Primitive type of a schema field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// JSON string.
    String,
    /// JSON `true` / `false`.
    Boolean,
    /// JSON number without a fractional part.
    Integer,
    /// Any JSON number.
    Number,
    /// JSON array whose every element has the inner type.
    Array(Box<FieldType>),
}

impl FieldType {
    /// Shorthand for `array<string>`.
    pub fn string_array() -> Self {
        FieldType::Array(Box::new(FieldType::String))
    }

    /// JSON-Schema fragment for this type.
    pub fn json_schema(&self) -> Value {
        match self {
            FieldType::String => json!({ "type": "string" }),
            FieldType::Boolean => json!({ "type": "boolean" }),
            FieldType::Integer => json!({ "type": "integer" }),
            FieldType::Number => json!({ "type": "number" }),
            FieldType::Array(item) => json!({ "type": "array", "items": item.json_schema() }),
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "string"),
            FieldType::Boolean => write!(f, "boolean"),
            FieldType::Integer => write!(f, "integer"),
            FieldType::Number => write!(f, "number"),
            FieldType::Array(item) => write!(f, "array<{item}>"),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One declared field of a [`SchemaContract`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Field name as it appears in the JSON object.
    pub name: String,
    /// Declared type.
    #[serde(rename = "type")]
    pub ty: FieldType,
    /// Whether the field must be present (and non-null).
    pub required: bool,
    /// Description forwarded to the backend to guide generation.
    pub description: Option<String>,
}

// ---------------------------------------------------------------------------
// Validation errors
// ---------------------------------------------------------------------------

/// A field whose value has the wrong JSON type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeMismatch {
    /// Path of the offending value: a field name, `field[index]` for array
    /// elements, or `$` for the document root.
    pub field: String,
    /// Declared type.
    pub expected: String,
    /// JSON type actually found.
    pub found: String,
}

/// Every violation found while validating one value against a contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaError {
    /// Required fields that were absent or `null`, in declaration order.
    pub missing_fields: Vec<String>,
    /// Fields present with the wrong type.
    pub type_mismatches: Vec<TypeMismatch>,
    /// Fields not declared by a contract that rejects additional properties.
    pub unexpected_fields: Vec<String>,
}

impl SchemaError {
    /// Returns `true` when no violation was recorded.
    pub fn is_empty(&self) -> bool {
        self.missing_fields.is_empty()
            && self.type_mismatches.is_empty()
            && self.unexpected_fields.is_empty()
    }
}

impl std::fmt::Display for SchemaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();
        if !self.missing_fields.is_empty() {
            parts.push(format!("missing fields [{}]", self.missing_fields.join(", ")));
        }
        if !self.type_mismatches.is_empty() {
            let mismatches: Vec<String> = self
                .type_mismatches
                .iter()
                .map(|m| format!("{}: expected {}, found {}", m.field, m.expected, m.found))
                .collect();
            parts.push(format!("type mismatches [{}]", mismatches.join("; ")));
        }
        if !self.unexpected_fields.is_empty() {
            parts.push(format!(
                "unexpected fields [{}]",
                self.unexpected_fields.join(", ")
            ));
        }
        write!(f, "schema validation failed: {}", parts.join(", "))
    }
}

impl std::error::Error for SchemaError {}

// ---------------------------------------------------------------------------
// Structured results
// ---------------------------------------------------------------------------

/// A stage's schema-validated output.
///
/// Only [`SchemaContract::validate`] constructs values of this type, so holding
/// one is proof that it matched its contract. It is read-only once produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct StructuredResult(Map<String, Value>);

impl StructuredResult {
    /// Returns the raw value of a field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Returns a string field.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    /// Returns a boolean field.
    pub fn get_bool(&self, field: &str) -> Option<bool> {
        self.0.get(field).and_then(Value::as_bool)
    }

    /// Returns an array-of-strings field.
    pub fn get_str_array(&self, field: &str) -> Option<Vec<&str>> {
        self.0
            .get(field)?
            .as_array()?
            .iter()
            .map(Value::as_str)
            .collect()
    }

    /// Iterates over field names in the order the backend produced them.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Borrows the underlying JSON object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Returns the result as a JSON value.
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Deserialises the result into a typed record.
    pub fn deserialize_into<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.to_value())
    }
}

// ---------------------------------------------------------------------------
// Contracts
// ---------------------------------------------------------------------------

/// JSON-Schema rendering of a contract, in the shape OpenAI-compatible
/// backends accept as `response_format.json_schema`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchemaDescriptor {
    /// Contract name.
    pub name: SchemaName,
    /// JSON-Schema object document.
    pub schema: Value,
    /// `true` when the backend should decode strictly (no extra properties).
    pub strict: bool,
}

/// Declared required shape of a stage's output.
#[derive(Clone, Serialize)]
pub struct SchemaContract {
    name: SchemaName,
    fields: Vec<FieldSpec>,
    additional_properties: bool,
    #[serde(skip)]
    validator: Arc<Validator>,
}

impl std::fmt::Debug for SchemaContract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaContract")
            .field("name", &self.name)
            .field("fields", &self.fields)
            .field("additional_properties", &self.additional_properties)
            .finish_non_exhaustive()
    }
}

impl PartialEq for SchemaContract {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.fields == other.fields
            && self.additional_properties == other.additional_properties
    }
}

impl Eq for SchemaContract {}

impl SchemaContract {
    /// Starts a contract with the given name. Additional properties are
    /// rejected unless [`SchemaContractBuilder::allow_additional_properties`]
    /// is called.
    pub fn builder(name: impl Into<String>) -> SchemaContractBuilder {
        SchemaContractBuilder {
            name: name.into(),
            fields: Vec::new(),
            additional_properties: false,
        }
    }

    /// Contract name.
    pub fn name(&self) -> &SchemaName {
        &self.name
    }

    /// Declared fields in declaration order.
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Whether undeclared fields are accepted.
    pub fn allows_additional_properties(&self) -> bool {
        self.additional_properties
    }

    /// Validates `raw` against the contract, collecting every violation.
    ///
    /// `null` in a declared field counts as absent.
    pub fn validate(&self, raw: &Value) -> Result<StructuredResult, SchemaError> {
        let Some(object) = raw.as_object() else {
            return Err(SchemaError {
                type_mismatches: vec![TypeMismatch {
                    field: "$".to_string(),
                    expected: "object".to_string(),
                    found: json_kind(raw).to_string(),
                }],
                ..SchemaError::default()
            });
        };

        let instance = Value::Object(
            object
                .iter()
                .filter(|(key, value)| !(value.is_null() && self.field(key).is_some()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        );

        let mut error = SchemaError::default();
        for violation in self.validator.iter_errors(&instance) {
            let segments = pointer_segments(violation.instance_path().as_str());
            match violation.kind() {
                ValidationErrorKind::Required { property } => error
                    .missing_fields
                    .push(property.as_str().map_or_else(|| property.to_string(), str::to_string)),
                ValidationErrorKind::AdditionalProperties { unexpected } => {
                    error.unexpected_fields.extend(unexpected.iter().cloned())
                }
                ValidationErrorKind::Type { .. } => {
                    let (field, expected) = self.expected_at(&segments);
                    error.type_mismatches.push(TypeMismatch {
                        field,
                        expected,
                        found: json_kind(violation.instance()).to_string(),
                    });
                }
                _ => {
                    let (field, _) = self.expected_at(&segments);
                    error.type_mismatches.push(TypeMismatch {
                        field,
                        expected: violation.to_string(),
                        found: json_kind(violation.instance()).to_string(),
                    });
                }
            }
        }

        dedup(&mut error.missing_fields, |name| name.clone());
        dedup(&mut error.unexpected_fields, |name| name.clone());
        dedup(&mut error.type_mismatches, |m| m.field.clone());
        error
            .missing_fields
            .sort_by_key(|name| self.position(name.as_str()));
        error
            .type_mismatches
            .sort_by_key(|m| self.position(m.field.split('[').next().unwrap_or_default()));

        if error.is_empty() {
            Ok(StructuredResult(object.clone()))
        } else {
            Err(error)
        }
    }

    fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    fn position(&self, name: &str) -> usize {
        self.fields
            .iter()
            .position(|f| f.name == name)
            .unwrap_or(self.fields.len())
    }

    /// Display path (`field`, `field[index]`, or `$`) and declared type of the
    /// value at a JSON-pointer location.
    fn expected_at(&self, segments: &[String]) -> (String, String) {
        let Some((name, indices)) = segments.split_first() else {
            return ("$".to_string(), "object".to_string());
        };
        let mut path = name.clone();
        let mut ty = self.field(name).map(|f| &f.ty);
        for index in indices {
            path.push_str(&format!("[{index}]"));
            ty = match ty {
                Some(FieldType::Array(item)) => Some(item.as_ref()),
                _ => None,
            };
        }
        let expected = ty.map_or_else(|| "undeclared".to_string(), ToString::to_string);
        (path, expected)
    }

    /// Renders the contract as a JSON-Schema descriptor.
    ///
    /// `strict` is set only when undeclared fields are rejected and every
    /// field is required, since strict decoding treats every property as
    /// required.
    pub fn descriptor(&self) -> SchemaDescriptor {
        SchemaDescriptor {
            name: self.name.clone(),
            schema: render_schema(&self.fields, self.additional_properties),
            strict: !self.additional_properties && self.fields.iter().all(|f| f.required),
        }
    }
}

fn render_schema(fields: &[FieldSpec], additional_properties: bool) -> Value {
    let mut properties = Map::new();
    for field in fields {
        let mut property = field.ty.json_schema();
        if let (Some(description), Value::Object(map)) = (&field.description, &mut property) {
            map.insert("description".to_string(), json!(description));
        }
        properties.insert(field.name.clone(), property);
    }
    let required: Vec<&str> = fields
        .iter()
        .filter(|f| f.required)
        .map(|f| f.name.as_str())
        .collect();

    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": additional_properties,
    })
}

/// Drops repeated entries, keeping the first occurrence of each key.
fn dedup<T>(items: &mut Vec<T>, key: impl Fn(&T) -> String) {
    let mut seen = HashSet::new();
    items.retain(|item| seen.insert(key(item)));
}

/// Splits a JSON pointer (`/field/0`) into unescaped segments.
fn pointer_segments(pointer: &str) -> Vec<String> {
    pointer
        .split('/')
        .skip(1)
        .map(|segment| segment.replace("~1", "/").replace("~0", "~"))
        .collect()
}

/// Builder for [`SchemaContract`].
#[derive(Debug)]
pub struct SchemaContractBuilder {
    name: String,
    fields: Vec<FieldSpec>,
    additional_properties: bool,
}

impl SchemaContractBuilder {
    /// Declares a required field.
    pub fn required(mut self, name: &str, ty: FieldType, description: &str) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            ty,
            required: true,
            description: Some(description.to_string()).filter(|d| !d.is_empty()),
        });
        self
    }

    /// Declares an optional field.
    pub fn optional(mut self, name: &str, ty: FieldType, description: &str) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            ty,
            required: false,
            description: Some(description.to_string()).filter(|d| !d.is_empty()),
        });
        self
    }

    /// Accepts fields the contract does not declare.
    pub fn allow_additional_properties(mut self) -> Self {
        self.additional_properties = true;
        self
    }

    /// Finishes the contract.
    ///
    /// Fails if the name is blank, no field is declared, or a field name is
    /// blank or declared twice.
    pub fn build(self) -> Result<SchemaContract, ConfigurationError> {
        let name = SchemaName::new(self.name)
            .ok_or_else(|| ConfigurationError::new("schema name must not be empty"))?;
        if self.fields.is_empty() {
            return Err(ConfigurationError::new(format!(
                "schema '{name}' declares no fields"
            )));
        }
        let mut seen = HashSet::new();
        for field in &self.fields {
            if field.name.trim().is_empty() {
                return Err(ConfigurationError::new(format!(
                    "schema '{name}' declares a field with an empty name"
                )));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(ConfigurationError::new(format!(
                    "schema '{name}' declares field '{}' twice",
                    field.name
                )));
            }
        }
        let schema = render_schema(&self.fields, self.additional_properties);
        let validator = jsonschema::validator_for(&schema).map_err(|e| {
            ConfigurationError::new(format!("schema '{name}' does not compile: {e}"))
        })?;
        Ok(SchemaContract {
            name,
            fields: self.fields,
            additional_properties: self.additional_properties,
            validator: Arc::new(validator),
        })
    }
}
