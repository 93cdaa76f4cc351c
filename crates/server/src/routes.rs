//! Download and health handlers

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue};
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use filerocket_relay_core::{DownloadBody, PickupCode};

use crate::error::ApiError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    #[serde(rename = "pickupCode")]
    pub pickup_code: Option<String>,
}

/// `GET /api/download/{code}`
pub async fn download_by_path(State(state): State<AppState>, Path(code): Path<String>) -> Response {
    open_download(&state, Some(code)).await
}

/// `GET /download?pickupCode={code}`
pub async fn download_by_query(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> Response {
    open_download(&state, query.pickup_code).await
}

async fn open_download(state: &AppState, raw: Option<String>) -> Response {
    let Some(code) = raw.map(PickupCode::from).filter(|code| !code.is_empty()) else {
        return ApiError::bad_request("A pickup code is required").into_response();
    };

    match state.coordinator.open_download(&code).await {
        Ok(body) => {
            info!("Streaming download for {}", code);
            download_response(body)
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}

fn download_response(body: DownloadBody) -> Response {
    let framing = body.headers;
    let mut response = Response::new(Body::from_stream(body.stream));
    let headers = response.headers_mut();

    let content_type = HeaderValue::from_str(&framing.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_TYPE, content_type);
    if let Ok(disposition) = HeaderValue::from_str(&framing.content_disposition) {
        headers.insert(header::CONTENT_DISPOSITION, disposition);
    }
    if let Some(length) = framing.content_length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    }
    response
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "activeSessions": state.coordinator.active_sessions(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}
