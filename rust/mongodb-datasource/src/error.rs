use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Failure of a single query target. Never crosses the batch boundary as a
/// panic; the batch collects one of these per failed target.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslateError {
    #[error("Please enter the query text")]
    EmptyQuery,

    /// JSON parse failure or a legacy-JS shape mismatch. `detail` keeps the
    /// underlying parser message for logs; the user-facing text is fixed.
    #[error("Invalid query")]
    MalformedSyntax { detail: Option<String> },

    #[error("{0}")]
    SandboxEvaluation(String),

    #[error("script evaluation timed out after {budget_ms}ms")]
    SandboxTimeout { budget_ms: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("{}", format_schema_violation(.message, .stage))]
    SchemaViolation {
        message: String,
        stage: Option<usize>,
    },

    #[error("Collection field is required")]
    CollectionMissing,

    /// Transport failure reported by the database collaborator, unchanged.
    #[error("{0}")]
    Database(String),

    /// Rows came back but could not be shaped into frames.
    #[error("{0}")]
    Frame(String),
}

fn format_schema_violation(message: &str, stage: &Option<usize>) -> String {
    match stage {
        Some(index) => format!("stage {index}: {message}"),
        None => message.to_string(),
    }
}

impl TranslateError {
    pub fn malformed(detail: impl Into<String>) -> Self {
        TranslateError::MalformedSyntax {
            detail: Some(detail.into()),
        }
    }

    pub fn schema(message: impl Into<String>, stage: Option<usize>) -> Self {
        TranslateError::SchemaViolation {
            message: message.into(),
            stage,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TranslateError::EmptyQuery => "empty_query",
            TranslateError::MalformedSyntax { .. } => "malformed_syntax",
            TranslateError::SandboxEvaluation(_) | TranslateError::SandboxTimeout { .. } => {
                "sandbox_evaluation"
            }
            TranslateError::Cancelled => "cancelled",
            TranslateError::SchemaViolation { .. } => "schema_violation",
            TranslateError::CollectionMissing => "collection_missing",
            TranslateError::Database(_) => "database",
            TranslateError::Frame(_) => "frame",
        }
    }
}

/// Per-target error entry reported when a whole batch fails.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TargetError {
    pub ref_id: String,
    pub kind: &'static str,
    pub error: String,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed")]
    Auth,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("Mix of streaming requests and normal requests is not supported")]
    StreamingModeConflict,

    #[error("all query targets failed")]
    AllTargetsFailed(Vec<TargetError>),

    #[error("database error: {0}")]
    Database(String),

    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<TargetError>,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match self {
            ServiceError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Auth => StatusCode::UNAUTHORIZED,
            ServiceError::InvalidRequest(_) | ServiceError::AllTargetsFailed(_) => {
                StatusCode::BAD_REQUEST
            }
            ServiceError::StreamingModeConflict => StatusCode::CONFLICT,
            ServiceError::Database(_) => StatusCode::BAD_GATEWAY,
            ServiceError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if matches!(
            self,
            ServiceError::Config(_) | ServiceError::Database(_) | ServiceError::Internal(_)
        ) {
            error!(error = %self, "request failed");
        }

        let error = self.to_string();
        let errors = match self {
            ServiceError::AllTargetsFailed(errors) => errors,
            _ => Vec::new(),
        };
        (status, Json(ErrorBody { error, errors })).into_response()
    }
}
