//! Error types for the Tessera engine.
//!
//! `DefinitionError` covers invalid definitions; `AppError` is the
//! application-level error and implements `IntoResponse` for the HTTP API.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// A single invariant violation found while validating a definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub entity_kind: String,
    pub entity_id: String,
    /// Machine-readable code, e.g. `unknown_column`.
    pub code: String,
    pub message: String,
}

impl Violation {
    pub fn new(
        entity_kind: impl Into<String>,
        entity_id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            entity_kind: entity_kind.into(),
            entity_id: entity_id.into(),
            code: code.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} '{}': {} ({})",
            self.entity_kind, self.entity_id, self.message, self.code
        )
    }
}

/// Defects in the definitions themselves. These never reach execution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    /// Override rules name columns the target does not have.
    #[error("Mapping '{mapping}' overrides columns not on target '{target}': {}", columns.join(", "))]
    ConflictingRule {
        mapping: String,
        target: String,
        columns: Vec<String>,
    },

    /// Steps of a flow depend on each other in a cycle.
    #[error("Flow '{flow}' contains a dependency cycle: {}", steps.join(" -> "))]
    CyclicFlow { flow: String, steps: Vec<String> },

    #[error("Unknown {kind} '{id}'")]
    UnknownReference { kind: String, id: String },

    #[error("Step '{step}' depends on '{dependency}', which is not part of flow '{flow}'")]
    UnknownDependency {
        flow: String,
        step: String,
        dependency: String,
    },

    #[error("Invalid definition: {}", violations.iter().map(|v| v.to_string()).collect::<Vec<_>>().join("; "))]
    InvalidDefinition { violations: Vec<Violation> },
}

impl DefinitionError {
    pub fn unknown(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::UnknownReference {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConflictingRule { .. } => "conflicting_rule",
            Self::CyclicFlow { .. } => "cyclic_flow",
            Self::UnknownReference { .. } => "unknown_reference",
            Self::UnknownDependency { .. } => "unknown_dependency",
            Self::InvalidDefinition { .. } => "invalid_definition",
        }
    }
}

/// Application-level errors for the engine.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    /// The flow already has an active execution.
    #[error("Flow '{flow_id}' is already running as execution {execution_id}")]
    AlreadyRunning { flow_id: String, execution_id: Uuid },

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Malformed YAML or JSON input.
    #[error("Parse error: {0}")]
    Parse(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Definition(DefinitionError::UnknownReference { .. }) => StatusCode::NOT_FOUND,
            AppError::Definition(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::AlreadyRunning { .. } => StatusCode::CONFLICT,
            AppError::BadRequest(_) | AppError::Parse(_) => StatusCode::BAD_REQUEST,
            AppError::Database(_)
            | AppError::Internal(_)
            | AppError::Config(_)
            | AppError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let mut body = json!({
            "error": self.to_string(),
            "status": status.as_u16()
        });
        match &self {
            AppError::Definition(e) => {
                body["code"] = json!(e.code());
            }
            AppError::AlreadyRunning {
                flow_id,
                execution_id,
            } => {
                body["flow_id"] = json!(flow_id);
                body["execution_id"] = json!(execution_id);
            }
            _ => {}
        }

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_error() {
        let err = AppError::NotFound("Execution 42".to_string());
        assert_eq!(err.to_string(), "Resource not found: Execution 42");
    }

    #[test]
    fn test_cyclic_flow_message_names_steps() {
        let err = DefinitionError::CyclicFlow {
            flow: "nightly".into(),
            steps: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(
            err.to_string(),
            "Flow 'nightly' contains a dependency cycle: a -> b -> a"
        );
        assert_eq!(err.code(), "cyclic_flow");
    }

    #[test]
    fn test_already_running_status() {
        let err = AppError::AlreadyRunning {
            flow_id: "nightly".into(),
            execution_id: Uuid::nil(),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_definition_error_status() {
        let err: AppError = DefinitionError::unknown("flow", "missing").into();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);

        let cyclic: AppError = DefinitionError::CyclicFlow {
            flow: "f".into(),
            steps: vec!["a".into(), "a".into()],
        }
        .into();
        assert_eq!(cyclic.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
