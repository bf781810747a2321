// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use axum::{
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{debug, error};

/// Does two things:
/// 1. Logs the given message. A success status code (within 200-299) will cause a debug log to be
///    written, otherwise error will be written.
/// 2. Returns the given message in the body of JSON response with the given status code.
///
/// Response body format:
/// {
///     "message": message
/// }
pub fn log_and_create_http_response(message: &str, status: StatusCode) -> Response {
    if status.is_success() {
        debug!("{message}");
    } else {
        error!("{message}");
    }
    (status, Json(json!({ "message": message }))).into_response()
}

pub async fn handler_not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

/// Media type of the request without parameters, lowercased.
#[must_use]
pub fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .map(|media| media.trim().to_ascii_lowercase())
        .filter(|media| !media.is_empty())
}

/// `application/json` and any `+json` suffix type.
#[must_use]
pub fn is_json_media(media: &str) -> bool {
    media == "application/json" || media.ends_with("+json")
}

/// Any `text/*` media type.
#[must_use]
pub fn is_text_media(media: &str) -> bool {
    media.starts_with("text/")
}
