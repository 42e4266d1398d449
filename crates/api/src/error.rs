//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use messaging::MessagingError;
use saga::SagaError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Saga engine error.
    Saga(SagaError),
    /// The create command could not be published.
    Messaging(MessagingError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Saga(err) => saga_error_to_response(err),
            ApiError::Messaging(err) => messaging_error_to_response(err),
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn saga_error_to_response(err: SagaError) -> (StatusCode, String) {
    match &err {
        SagaError::Validation(_) => (StatusCode::BAD_REQUEST, err.to_string()),
        SagaError::NotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
        SagaError::Contended(_) => (StatusCode::CONFLICT, err.to_string()),
        SagaError::Messaging(_) | SagaError::Store(_) if err.is_transient() => {
            tracing::warn!(error = %err, "saga backend unavailable");
            (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
        }
        _ => {
            tracing::error!(error = %err, "internal server error");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

fn messaging_error_to_response(err: MessagingError) -> (StatusCode, String) {
    if err.is_transient() {
        tracing::warn!(error = %err, "broker unavailable");
        (StatusCode::SERVICE_UNAVAILABLE, err.to_string())
    } else {
        tracing::error!(error = %err, "failed to publish");
        (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}

impl From<MessagingError> for ApiError {
    fn from(err: MessagingError) -> Self {
        ApiError::Messaging(err)
    }
}

#[cfg(test)]
mod tests {
    use common::TransactionId;

    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = [
            (ApiError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (ApiError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                ApiError::Saga(SagaError::Validation("no steps".into())),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::Saga(SagaError::NotFound(TransactionId::new())),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::Messaging(MessagingError::BrokerUnavailable("down".into())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }
}
