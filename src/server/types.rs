//! Response helpers shared by the server endpoints.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Generic API error response: a stable message plus an optional detail
/// string for the operator-facing surfaces. Store error causes never travel
/// through here to clients of the limited API.
pub struct ApiErrorType {
    status: StatusCode,
    message: String,
    detail: Option<String>,
}

impl From<(StatusCode, &str, Option<String>)> for ApiErrorType {
    fn from((status, message, detail): (StatusCode, &str, Option<String>)) -> Self {
        ApiErrorType {
            status,
            message: message.to_string(),
            detail,
        }
    }
}

impl IntoResponse for ApiErrorType {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.message,
            "detail": self.detail,
        });
        (self.status, Json(body)).into_response()
    }
}
