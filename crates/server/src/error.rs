//! The API error envelope: `{error, message, correlation_id}` with typed
//! error codes and the matching HTTP status.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use aegis_store::StoreError;

/// Errors surfaced by API handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed request parameters or body.
    #[error("{0}")]
    BadRequest(String),

    /// The referenced resource does not exist.
    #[error("{0}")]
    NotFound(String),

    /// The request conflicts with current state (already decided, expired,
    /// duplicate name).
    #[error("{0}")]
    Conflict(String),

    /// The request is well-formed but violates a domain rule (policy
    /// denial, bad approver).
    #[error("{0}")]
    Validation(String),

    /// Anything else.
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// The wire error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Validation(_) => "validation_error",
            Self::Internal(_) => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Attach the request's correlation id and convert to a response.
    #[must_use]
    pub fn into_response_with(self, correlation_id: &str) -> Response {
        let body = serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
            "correlation_id": correlation_id,
        });
        (self.status(), Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(msg) => Self::NotFound(msg),
            StoreError::Conflict(msg) => Self::Conflict(msg),
            StoreError::Connection(msg) | StoreError::Backend(msg) => Self::Internal(msg),
            StoreError::Serialization(msg) => Self::Internal(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Handlers that carry a correlation id use `into_response_with`;
        // this path covers extractor failures where none exists yet.
        self.into_response_with("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_statuses_line_up() {
        assert_eq!(ApiError::BadRequest("x".into()).code(), "bad_request");
        assert_eq!(ApiError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::Conflict("x".into()).status(), StatusCode::CONFLICT);
        assert_eq!(
            ApiError::Validation("x".into()).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError::Internal("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn store_errors_map_to_api_codes() {
        assert_eq!(
            ApiError::from(StoreError::NotFound("p".into())).code(),
            "not_found"
        );
        assert_eq!(
            ApiError::from(StoreError::Conflict("c".into())).code(),
            "conflict"
        );
        assert_eq!(
            ApiError::from(StoreError::Backend("b".into())).code(),
            "internal_error"
        );
    }
}
