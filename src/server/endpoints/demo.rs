//! Minimal rate-limited endpoint for exercising the pipeline end to end.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde_json::json;

use crate::engine::AdmissionDecision;
use crate::server::middleware::RequestId;

/// GET /api/ping
/// Echoes the admission decision the middleware attached to the request.
pub async fn get_ping(
    decision: Option<Extension<AdmissionDecision>>,
    request_id: Option<Extension<RequestId>>,
) -> Response {
    let body = match decision {
        Some(Extension(decision)) => json!({
            "message": "pong",
            "identity": decision.identity,
            "tier": decision.tier,
            "remaining": decision.remaining,
            "request_id": request_id.map(|Extension(RequestId(id))| id),
        }),
        None => json!({ "message": "pong" }),
    };
    (StatusCode::OK, Json(body)).into_response()
}
