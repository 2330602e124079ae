//! Input validation for identifiers and usage plans.
//!
//! Every externally supplied identifier ends up embedded in a counter key, so
//! validation runs before a plan is stored or a request is evaluated.

use thiserror::Error;

use crate::types::UsagePlan;

/// Validation error types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Identifier is empty.
    #[error("{field} must not be empty")]
    Empty {
        /// Field name.
        field: &'static str,
    },

    /// Input exceeds maximum allowed length.
    #[error("{field} exceeds maximum length ({max} bytes, got {actual})")]
    TooLong {
        /// Field name.
        field: &'static str,
        /// Maximum allowed length.
        max: usize,
        /// Actual input length.
        actual: usize,
    },

    /// Disallowed characters in input.
    #[error("{field} contains disallowed characters")]
    DisallowedChars {
        /// Field name.
        field: &'static str,
    },

    /// Unknown entity type.
    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),

    /// Metadata nesting is too deep.
    #[error("metadata nesting depth exceeds maximum ({0})")]
    MetadataTooDeep(usize),
}

/// Size limits per input type.
pub mod limits {
    /// Maximum identifier length in bytes.
    pub const MAX_IDENTIFIER_LENGTH: usize = 256;

    /// Maximum metadata JSON nesting depth.
    pub const MAX_METADATA_DEPTH: usize = 16;

    /// Maximum number of per-model overrides in one plan.
    pub const MAX_MODEL_OVERRIDES: usize = 1024;
}

/// Separator between counter key segments.
pub const KEY_SEPARATOR: char = ':';

/// Validate an entity or tenant identifier.
///
/// # Errors
///
/// Returns an error if the identifier is empty, too long, contains control
/// characters, or contains the key separator.
pub fn validate_identifier(field: &'static str, value: &str) -> Result<(), ValidationError> {
    validate_model_id_as(field, value)?;
    if value.contains(KEY_SEPARATOR) {
        return Err(ValidationError::DisallowedChars { field });
    }
    Ok(())
}

/// Validate a model identifier. Model ids may contain `:`.
///
/// # Errors
///
/// Returns an error if the model id is empty, too long, or contains control
/// characters.
pub fn validate_model_id(value: &str) -> Result<(), ValidationError> {
    validate_model_id_as("model_id", value)
}

fn validate_model_id_as(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Empty { field });
    }
    if value.len() > limits::MAX_IDENTIFIER_LENGTH {
        return Err(ValidationError::TooLong {
            field,
            max: limits::MAX_IDENTIFIER_LENGTH,
            actual: value.len(),
        });
    }
    if value.chars().any(char::is_control) {
        return Err(ValidationError::DisallowedChars { field });
    }
    Ok(())
}

/// Validate a complete usage plan.
///
/// # Errors
///
/// Returns the first validation failure found.
pub fn validate_plan(plan: &UsagePlan) -> Result<(), ValidationError> {
    validate_identifier("entity_id", &plan.entity_id)?;
    validate_identifier("tenant_id", &plan.tenant_id)?;

    if let Some(budget_id) = &plan.budget_id {
        validate_model_id_as("budget_id", budget_id)?;
    }

    for model in plan.model_permissions.iter() {
        validate_model_id_as("model_permissions", model)?;
    }

    if plan.model_limits.len() > limits::MAX_MODEL_OVERRIDES {
        return Err(ValidationError::TooLong {
            field: "model_limits",
            max: limits::MAX_MODEL_OVERRIDES,
            actual: plan.model_limits.len(),
        });
    }
    for model in plan.model_limits.keys() {
        validate_model_id_as("model_limits", model)?;
    }

    for value in plan.metadata.values() {
        check_json_depth(value, 1, limits::MAX_METADATA_DEPTH)?;
    }

    Ok(())
}

/// Check JSON nesting depth.
fn check_json_depth(
    value: &serde_json::Value,
    depth: usize,
    max: usize,
) -> Result<(), ValidationError> {
    if depth > max {
        return Err(ValidationError::MetadataTooDeep(max));
    }

    match value {
        serde_json::Value::Array(arr) => {
            for item in arr {
                check_json_depth(item, depth + 1, max)?;
            }
        }
        serde_json::Value::Object(obj) => {
            for item in obj.values() {
                check_json_depth(item, depth + 1, max)?;
            }
        }
        _ => {}
    }

    Ok(())
}
