//! API error handling.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use quantum_core::Error;
use serde_json::json;

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    /// The scheduler cannot take the request right now.
    Unavailable {
        message: String,
        retry_after: Option<u64>,
    },
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, retry_after) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg, None),
            ApiError::Unavailable {
                message,
                retry_after,
            } => (StatusCode::SERVICE_UNAVAILABLE, message, retry_after),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg, None),
        };

        let body = Json(json!({
            "error": message
        }));

        let mut response = (status, body).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::NotFound(_) => ApiError::NotFound(message),
            Error::UnknownBase(_) | Error::CyclicDependency { .. } => ApiError::BadRequest(message),
            Error::InvalidTransition { .. } | Error::AncestorFailed { .. } => {
                ApiError::Conflict(message)
            }
            Error::QueueFull { waited, .. } => ApiError::Unavailable {
                message,
                retry_after: Some(waited.as_secs().max(1)),
            },
            Error::ShuttingDown => ApiError::Unavailable {
                message,
                retry_after: None,
            },
            Error::ExecutionFailed(_) | Error::Internal(_) => ApiError::Internal(message),
        }
    }
}
