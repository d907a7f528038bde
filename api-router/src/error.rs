use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::error::AppError;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Serialize, Clone)]
pub enum ApiError {
    #[error("Internal server error")]
    InternalError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),
}

impl ApiError {
    pub fn from_rejection(rejection: &JsonRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            Self::PayloadTooLarge(rejection.body_text())
        } else {
            Self::ValidationError(rejection.body_text())
        }
    }
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        match err {
            AppError::Validation(msg) => Self::ValidationError(msg),
            AppError::NotFound(msg) => Self::NotFound(msg),
            // Another tenant's resource looks exactly like a missing one.
            AppError::Ownership(msg) => Self::NotFound(msg),
            _ => {
                tracing::error!("Internal error: {:?}", err);
                Self::InternalError("Internal server error".to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::InternalError(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
            Self::ValidationError(message) => (StatusCode::BAD_REQUEST, message),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, message),
            Self::PayloadTooLarge(message) => (StatusCode::PAYLOAD_TOO_LARGE, message),
        };

        (
            status,
            Json(ErrorResponse {
                error: message,
                status: "error".to_string(),
            }),
        )
            .into_response()
    }
}

#[derive(Serialize, Debug)]
struct ErrorResponse {
    error: String,
    status: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fmt::Debug, time::Duration};

    fn assert_status_code<T: IntoResponse + Debug>(response: T, expected_status: StatusCode) {
        let response = response.into_response();
        assert_eq!(response.status(), expected_status);
    }

    #[test]
    fn app_errors_keep_their_status_class() {
        let api_error = ApiError::from(AppError::NotFound("document doc-1".to_string()));
        assert!(matches!(api_error, ApiError::NotFound(msg) if msg == "document doc-1"));

        let api_error = ApiError::from(AppError::Validation("tenant_id is required".to_string()));
        assert!(matches!(api_error, ApiError::ValidationError(msg) if msg == "tenant_id is required"));

        let api_error = ApiError::from(AppError::Ownership("document doc-2".to_string()));
        assert!(matches!(api_error, ApiError::NotFound(msg) if msg == "document doc-2"));
    }

    #[test]
    fn internal_errors_are_sanitized() {
        let api_error = ApiError::from(AppError::Timeout {
            operation: "create_knowledge_base".to_string(),
            after: Duration::from_secs(300),
        });
        assert!(
            matches!(&api_error, ApiError::InternalError(msg) if msg == "Internal server error")
        );
        assert_eq!(api_error.to_string(), "Internal server error");
        assert_status_code(api_error, StatusCode::INTERNAL_SERVER_ERROR);

        let api_error = ApiError::from(AppError::Provider("role arn leaked".to_string()));
        assert!(matches!(api_error, ApiError::InternalError(msg) if !msg.contains("arn")));

        let encoding = serde_json::from_str::<serde_json::Value>("[1,").expect_err("truncated json");
        let api_error = ApiError::from(AppError::Serde(encoding));
        assert!(matches!(api_error, ApiError::InternalError(_)));
    }

    #[test]
    fn response_status_codes() {
        assert_status_code(
            ApiError::ValidationError("bad".to_string()),
            StatusCode::BAD_REQUEST,
        );
        assert_status_code(ApiError::NotFound("gone".to_string()), StatusCode::NOT_FOUND);
        assert_status_code(
            ApiError::PayloadTooLarge("too big".to_string()),
            StatusCode::PAYLOAD_TOO_LARGE,
        );
    }
}
