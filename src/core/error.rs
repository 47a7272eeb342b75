//! Error types and handling for the Bedrock proxy.
//!
//! This module provides a unified error type [`AppError`] that covers the
//! proxy's error taxonomy and implements HTTP response conversion with an
//! OpenAI-shaped JSON body.

use crate::core::error_types::ErrorKind;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

/// Main error type for the application.
///
/// All errors in the application should be converted to this type for consistent handling.
#[derive(Error, Debug)]
pub enum AppError {
    /// Startup configuration errors (missing variables, unreadable files)
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    /// JSON serialization errors on the proxy side
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No credential set could be resolved for the request
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Request body violates the chat-completion schema
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// Requested model id does not resolve to a backend model
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// Backend answered with a domain error (invalid parameters, throttling, access denied)
    #[error("Backend rejected request: {message}")]
    BackendRejected {
        message: String,
        upstream_detail: Option<String>,
    },

    /// Backend could not be reached or reported itself unavailable
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Backend call exceeded the configured bound
    #[error("Backend timeout after {timeout_secs}s")]
    BackendTimeout { timeout_secs: u64 },

    /// Translation bug or invariant violation
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Taxonomy tag reported to clients.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Config(_) | AppError::Serialization(_) | AppError::Internal(_) => {
                ErrorKind::InternalError
            }
            AppError::Unauthenticated(_) => ErrorKind::Unauthenticated,
            AppError::MalformedRequest(_) => ErrorKind::MalformedRequest,
            AppError::ModelNotFound(_) => ErrorKind::ModelNotFound,
            AppError::BackendRejected { .. } => ErrorKind::BackendRejected,
            AppError::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            AppError::BackendTimeout { .. } => ErrorKind::BackendTimeout,
        }
    }

    /// HTTP status code for this error.
    pub fn status(&self) -> StatusCode {
        match self.kind() {
            ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorKind::MalformedRequest => StatusCode::BAD_REQUEST,
            ErrorKind::ModelNotFound => StatusCode::NOT_FOUND,
            ErrorKind::BackendRejected | ErrorKind::BackendUnavailable => StatusCode::BAD_GATEWAY,
            ErrorKind::BackendTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Upstream detail passed through for debugging, if any.
    pub fn upstream_detail(&self) -> Option<&str> {
        match self {
            AppError::BackendRejected {
                upstream_detail, ..
            } => upstream_detail.as_deref(),
            _ => None,
        }
    }

    /// Render the OpenAI-shaped error body.
    ///
    /// Used both for HTTP error responses and for the terminal error event of a stream.
    pub fn to_error_body(&self) -> Value {
        let status = self.status();
        let mut error = json!({
            "message": self.to_string(),
            "type": self.kind().as_str(),
            "code": status.as_u16(),
        });
        if let Some(detail) = self.upstream_detail() {
            error["upstream_detail"] = Value::String(detail.to_string());
        }
        json!({ "error": error })
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(error_type = %self.kind(), status = status.as_u16(), "{}", self);
        } else {
            tracing::warn!(error_type = %self.kind(), status = status.as_u16(), "{}", self);
        }

        (status, Json(self.to_error_body())).into_response()
    }
}

/// Convenience type alias for Results using [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AppError::Unauthenticated("no credentials".to_string());
        assert_eq!(err.to_string(), "Unauthenticated: no credentials");

        let err = AppError::Internal("test error".to_string());
        assert_eq!(err.to_string(), "Internal error: test error");

        let err = AppError::BackendTimeout { timeout_secs: 30 };
        assert_eq!(err.to_string(), "Backend timeout after 30s");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AppError::Unauthenticated(String::new()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::MalformedRequest(String::new()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::ModelNotFound(String::new()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::BackendRejected {
                message: String::new(),
                upstream_detail: None
            }
            .status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AppError::BackendUnavailable(String::new()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AppError::BackendTimeout { timeout_secs: 1 }.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            AppError::Internal(String::new()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_body_shape() {
        let err = AppError::BackendRejected {
            message: "Malformed input request".to_string(),
            upstream_detail: Some("ValidationException: temperature out of range".to_string()),
        };
        let body = err.to_error_body();
        assert_eq!(body["error"]["type"], "backend_rejected");
        assert_eq!(body["error"]["code"], 502);
        assert_eq!(
            body["error"]["upstream_detail"],
            "ValidationException: temperature out of range"
        );
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("Malformed input request"));
    }

    #[test]
    fn test_error_body_omits_missing_detail() {
        let body = AppError::ModelNotFound("gpt-4".to_string()).to_error_body();
        assert_eq!(body["error"]["type"], "model_not_found");
        assert!(body["error"].get("upstream_detail").is_none());
    }

    #[test]
    fn test_error_into_response() {
        let response = AppError::Unauthenticated("missing".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_serialization_error_is_internal() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: AppError = json_err.into();
        assert_eq!(err.kind(), ErrorKind::InternalError);
        assert_eq!(
            err.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_from_anyhow() {
        let app_err: AppError = anyhow::anyhow!("missing PORT").into();
        assert!(matches!(app_err, AppError::Config(_)));
    }
}
