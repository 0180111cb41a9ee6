//! Service-level status endpoints (excluded from rate limiting).

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::sync::Arc;

use crate::types::AppState;

/// GET /
/// Service identification and quick-start pointers.
pub async fn get_root() -> Response {
    let body = json!({
        "name": "rategate",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "operational",
        "quick_start": {
            "1": "Include the X-API-Key header with your requests",
            "2": "Use /api/ping to verify rate limiting",
            "3": "Check /admin/health to see system health",
        },
    });
    (StatusCode::OK, Json(body)).into_response()
}

/// GET /health
/// Liveness check covering the store connection and component states.
pub async fn get_health(State(s): State<Arc<AppState>>) -> Response {
    let store_healthy = s.store.ping().await.is_ok();
    let system_health = match s.oracle.snapshot().await {
        Ok(record) => record.status.as_str(),
        Err(_) => "unknown",
    };
    let (api_keys, identities) = s.directory.counts();

    let body = json!({
        "status": if store_healthy { "healthy" } else { "unhealthy" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "components": {
            "store": if store_healthy { "healthy" } else { "unhealthy" },
            "circuit_breaker": s.store.breaker_state(),
            "system_health": system_health,
        },
        "directory": {
            "api_keys": api_keys,
            "identities": identities,
        },
    });

    (StatusCode::OK, Json(body)).into_response()
}
