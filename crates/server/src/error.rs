//! HTTP error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

use filerocket_relay_core::{ErrorKind, RelayError};

/// Error body returned by the HTTP handlers
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: ErrorKind::InvalidCode,
            message: message.into(),
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        let status = match &err {
            RelayError::InvalidCode(_) | RelayError::MissingMetadata(_) => StatusCode::NOT_FOUND,
            RelayError::InvalidState { .. }
            | RelayError::SinkUnavailable(_)
            | RelayError::CodeAlreadyClaimed(_)
            | RelayError::MetadataAlreadySet(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.kind,
            "message": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}
