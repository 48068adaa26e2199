//! Error handling module
//!
//! Two layers of errors live here:
//! - `ControlError`: the control-plane taxonomy shared by the decision client,
//!   plan compiler and reconciler. Each variant knows whether it is retryable
//!   and which condition reason it surfaces as.
//! - `AppError`: the HTTP-facing error returned by API handlers.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Control-plane error taxonomy
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("Invalid resource identifier: {0}")]
    InvalidResource(String),

    #[error("Decision service unavailable: {0}")]
    DecisionUnavailable(String),

    #[error("Malformed decision: {0}")]
    DecisionMalformed(String),

    #[error("Conflicting actions for {asset}: {detail}")]
    ConflictingActions { asset: String, detail: String },

    #[error("No capable module for {asset}: requires {required}")]
    NoCapableModule { asset: String, required: String },

    #[error("Module not ready: {0}")]
    ModuleUnhealthy(String),

    #[error("Deployment conflict: {0}")]
    DeploymentConflict(String),

    #[error("Module runtime error: {0}")]
    ModuleRuntime(String),
}

impl ControlError {
    /// Transient classes are requeued with backoff; everything else is
    /// recorded against the affected asset and left alone.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ControlError::DecisionUnavailable(_)
                | ControlError::ModuleUnhealthy(_)
                | ControlError::DeploymentConflict(_)
                | ControlError::ModuleRuntime(_)
        )
    }

    /// Reason code written into asset conditions
    pub fn reason(&self) -> &'static str {
        match self {
            ControlError::InvalidResource(_) => "InvalidResource",
            ControlError::DecisionUnavailable(_) => "DecisionUnavailable",
            ControlError::DecisionMalformed(_) => "DecisionMalformed",
            ControlError::ConflictingActions { .. } => "ConflictingActions",
            ControlError::NoCapableModule { .. } => "NoCapableModule",
            ControlError::ModuleUnhealthy(_) => "ModuleUnhealthy",
            ControlError::DeploymentConflict(_) => "DeploymentConflict",
            ControlError::ModuleRuntime(_) => "ModuleRuntimeError",
        }
    }
}

/// Result alias for control-plane operations
pub type ControlResult<T> = Result<T, ControlError>;

/// Application-wide (HTTP) error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ControlError> for AppError {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::InvalidResource(msg) => AppError::BadRequest(msg),
            ControlError::DeploymentConflict(msg) => AppError::Conflict(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        AppError::Validation(errors.to_string())
    }
}

/// Error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message, details) = match &self {
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                msg.clone(),
                None,
            ),
            AppError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                msg.clone(),
                None,
            ),
            AppError::Conflict(msg) => (
                StatusCode::CONFLICT,
                "CONFLICT",
                msg.clone(),
                None,
            ),
            AppError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                "BAD_REQUEST",
                msg.clone(),
                None,
            ),
            AppError::Internal(msg) => {
                error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                    Some(msg.clone()),
                )
            }
        };

        let body = Json(ErrorResponse {
            success: false,
            message,
            error: details,
            code: Some(error_code.to_string()),
        });

        (status, body).into_response()
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, AppError>;

/// Helper function to create a not found error
pub fn not_found_error(msg: impl Into<String>) -> AppError {
    AppError::NotFound(msg.into())
}

/// Helper function to create a conflict error
pub fn conflict_error(msg: impl Into<String>) -> AppError {
    AppError::Conflict(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(ControlError::DecisionUnavailable("timeout".into()).is_retryable());
        assert!(ControlError::ModuleUnhealthy("starting".into()).is_retryable());
        assert!(ControlError::DeploymentConflict("edited".into()).is_retryable());
        assert!(!ControlError::InvalidResource("x".into()).is_retryable());
        assert!(!ControlError::DecisionMalformed("x".into()).is_retryable());
        assert!(!ControlError::NoCapableModule {
            asset: "a/b".into(),
            required: "Custom:encrypt".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_status_codes() {
        let cases = vec![
            (AppError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (AppError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (AppError::Conflict("x".into()), StatusCode::CONFLICT),
            (AppError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (AppError::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }

    #[test]
    fn test_invalid_resource_maps_to_bad_request() {
        let err: AppError = ControlError::InvalidResource("no catalog".into()).into();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
