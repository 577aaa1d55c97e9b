//! Input validation against the OpenAPI schema.
//!
//! The worker reports its OpenAPI schema at setup. Inputs are checked against
//! its `Input` component before a prediction starts, so a bad request fails
//! without touching the worker. Messages follow pydantic's wording.

use std::collections::HashMap;

use serde_json::{Map, Value};

const SCHEMA_REF_PREFIX: &str = "#/components/schemas/";

/// Self-referencing schemas are cut off (accept anything) past this depth.
const MAX_REF_DEPTH: usize = 8;

/// One offending input field.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    pub field: String,
    pub msg: String,
    /// Pydantic error kind, e.g. "value_error.missing".
    pub error_type: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, msg: impl Into<String>, error_type: &str) -> Self {
        Self {
            field: field.into(),
            msg: msg.into(),
            error_type: error_type.to_string(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.msg)
    }
}

/// Join errors into the single message recorded on a failed prediction.
pub fn format_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Pydantic's message for a value that doesn't match the declared JSON type.
fn type_error_message(declared: &str, value: &Value) -> Option<&'static str> {
    let matches = match declared {
        "integer" => match value {
            Value::Number(n) => {
                n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            _ => false,
        },
        "number" => value.is_number(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    };
    if matches {
        return None;
    }
    Some(match declared {
        "integer" => "value is not a valid integer",
        "number" => "value is not a valid float",
        "string" => "str type expected",
        "boolean" => "value could not be parsed to a boolean",
        "array" => "value is not a valid list",
        _ => "value is not a valid dict",
    })
}

/// Validator for the model's `Input` component.
///
/// Presence, unknown fields and declared types are checked directly so each
/// gets pydantic's message. Everything else (enums, bounds, patterns) goes
/// through the compiled JSON Schema.
pub struct InputValidator {
    compiled: jsonschema::Validator,
    /// Property name to its declared `type`, if it states one.
    fields: HashMap<String, Option<String>>,
    required: Vec<String>,
}

impl InputValidator {
    /// Build a validator from a full OpenAPI document. `None` when the
    /// document has no `Input` component or it does not compile.
    pub fn from_openapi_schema(document: &Value) -> Option<Self> {
        let schemas = document.get("components")?.get("schemas")?.as_object()?;
        let input = schemas.get("Input")?;

        let fields = input
            .get("properties")
            .and_then(Value::as_object)
            .into_iter()
            .flatten()
            .map(|(name, property)| {
                let declared = property.get("type").and_then(Value::as_str);
                (name.clone(), declared.map(str::to_string))
            })
            .collect();

        let required = input
            .get("required")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();

        let mut resolved = input.clone();
        inline_refs(&mut resolved, schemas, 0);

        let compiled = match jsonschema::validator_for(&resolved) {
            Ok(compiled) => compiled,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to compile input schema, skipping validation");
                return None;
            }
        };

        Some(Self {
            compiled,
            fields,
            required,
        })
    }

    /// Check `input`, reporting at most one error per field.
    pub fn validate(&self, input: &Value) -> Result<(), Vec<ValidationError>> {
        let Some(object) = input.as_object() else {
            return Err(vec![ValidationError::new(
                "__root__",
                "value is not a valid dict",
                "type_error.dict",
            )]);
        };

        let mut errors: Vec<ValidationError> = self
            .required
            .iter()
            .filter(|name| !object.contains_key(name.as_str()))
            .map(|name| ValidationError::new(name, "field required", "value_error.missing"))
            .collect();

        for (name, value) in object {
            match self.fields.get(name) {
                None => errors.push(ValidationError::new(
                    name,
                    "extra fields not permitted",
                    "value_error.extra",
                )),
                Some(Some(declared)) => {
                    if let Some(msg) = type_error_message(declared, value) {
                        errors.push(ValidationError::new(name, msg, "type_error"));
                    }
                }
                Some(None) => {}
            }
        }

        for error in self.compiled.iter_errors(input) {
            let path = error.instance_path().to_string();
            let field = path.trim_start_matches('/').split('/').next().unwrap_or_default();
            // Root errors repeat the presence checks above.
            if field.is_empty() || errors.iter().any(|e| e.field == field) {
                continue;
            }
            errors.push(ValidationError::new(field, error.to_string(), "value_error"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Replace `{"$ref": "#/components/schemas/Name"}` with the named schema, so
/// the `Input` component compiles on its own. Choices arrive this way.
fn inline_refs(value: &mut Value, schemas: &Map<String, Value>, depth: usize) {
    if depth > MAX_REF_DEPTH {
        *value = Value::Bool(true);
        return;
    }
    let target = value
        .get("$ref")
        .and_then(Value::as_str)
        .and_then(|r| r.strip_prefix(SCHEMA_REF_PREFIX))
        .and_then(|name| schemas.get(name));
    if let Some(target) = target {
        *value = target.clone();
        inline_refs(value, schemas, depth + 1);
        return;
    }

    match value {
        Value::Object(map) => {
            for child in map.values_mut() {
                inline_refs(child, schemas, depth);
            }
        }
        Value::Array(items) => {
            for child in items {
                inline_refs(child, schemas, depth);
            }
        }
        _ => {}
    }
}
