//! Typed errors for the extraction orchestrator.
//!
//! Uses `thiserror` for library errors (not `anyhow`) to provide
//! strongly-typed, composable error handling.
//!
//! Only hard-stop conditions are errors. Inference timeouts and incomplete
//! inference calls are soft failures and surface as `None` from the engines.

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during orchestration.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// A validation rule was violated (hard stop).
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Inference service failed outside the soft-failure contract
    #[error("inference service error: {0}")]
    Inference(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Storage operation failed
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A referenced record does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: Uuid },

    /// JSON parsing error
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Configuration error
    #[error("config error: {0}")]
    Config(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ExtractionError {
    /// Shorthand for a missing record.
    pub fn not_found(kind: &'static str, id: Uuid) -> Self {
        Self::NotFound { kind, id }
    }

    /// Wrap a lock-poisoning or backend message as a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into().into())
    }
}

/// Hard validation failures that stop a process.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// An identity process was created without any input artifacts.
    #[error("process {process_id} has no input artifacts")]
    NoInputArtifacts { process_id: Uuid },

    /// Remaining-field planning could not cover every field.
    #[error(
        "field coverage incomplete for {object_type} after {attempts} attempts; uncovered fields: {}",
        missing.join(", ")
    )]
    CoverageIncomplete {
        object_type: String,
        attempts: usize,
        missing: Vec<String>,
    },

    /// A runner configuration value is out of range.
    #[error("invalid config value for {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    /// A process names a group the current plan does not contain.
    #[error("process {process_id} references unknown group {key:?}")]
    UnknownGroup { process_id: Uuid, key: String },

    /// The task schema cannot be decomposed into object types.
    #[error("schema has no object types: {reason}")]
    EmptySchema { reason: String },
}

/// Result type alias for orchestration operations.
pub type Result<T> = std::result::Result<T, ExtractionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coverage_error_names_missing_fields() {
        let err = ValidationError::CoverageIncomplete {
            object_type: "Provider".to_string(),
            attempts: 3,
            missing: vec!["postal_code".to_string(), "fax".to_string()],
        };

        let message = err.to_string();
        assert!(message.contains("Provider"));
        assert!(message.contains("postal_code, fax"));
    }

    #[test]
    fn test_no_input_artifacts_message() {
        let id = Uuid::nil();
        let err: ExtractionError = ValidationError::NoInputArtifacts { process_id: id }.into();
        assert!(err.to_string().contains("has no input artifacts"));
    }
}
