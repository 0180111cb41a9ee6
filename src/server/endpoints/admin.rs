//! Administrative endpoints over the core components.
//!
//! Thin handlers over direct library calls: health writes on the oracle,
//! reloads on the directory, counter resets on the store. Excluded from
//! rate limiting by the default exclusion list; access control is expected
//! from the deployment in front of this service.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

use crate::config::LimiterConfig;
use crate::health::SystemHealth;
use crate::policy::{effective_limit, Tier};
use crate::server::types::ApiErrorType;
use crate::types::AppState;

/// Request body for health updates.
#[derive(Debug, Deserialize)]
pub struct SetHealthRequest {
    pub status: String,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
    #[serde(default)]
    pub updated_by: Option<String>,
}

fn readable_timestamp(timestamp: u64) -> Option<String> {
    chrono::DateTime::from_timestamp(timestamp as i64, 0).map(|dt| dt.to_rfc3339())
}

/// GET /admin/health
/// Returns the stored health record, bypassing the local cache.
pub async fn get_system_health(State(s): State<Arc<AppState>>) -> Response {
    match s.oracle.snapshot().await {
        Ok(record) => {
            let body = json!({
                "status": record.status,
                "timestamp": record.timestamp,
                "updated_by": record.updated_by,
                "last_updated": readable_timestamp(record.timestamp),
            });
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => {
            error!("failed to read system health: {}", e);
            ApiErrorType::from((
                StatusCode::SERVICE_UNAVAILABLE,
                "Failed to read system health",
                Some(e.to_string()),
            ))
            .into_response()
        }
    }
}

/// POST /admin/health
/// Updates the global health state; other instances converge within their
/// health-cache TTL.
pub async fn set_system_health(
    State(s): State<Arc<AppState>>,
    Json(request): Json<SetHealthRequest>,
) -> Response {
    let Some(status) = SystemHealth::from_request(&request.status) else {
        return ApiErrorType::from((
            StatusCode::BAD_REQUEST,
            "Invalid health status, expected NORMAL or DEGRADED",
            Some(request.status),
        ))
        .into_response();
    };

    let updated_by = request.updated_by.as_deref().unwrap_or("admin");
    match s.oracle.set(status, request.ttl_seconds, updated_by).await {
        Ok(record) => {
            let body = json!({
                "status": record.status,
                "timestamp": record.timestamp,
                "updated_by": record.updated_by,
                "ttl_seconds": request.ttl_seconds,
            });
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => {
            error!("failed to set system health: {}", e);
            ApiErrorType::from((
                StatusCode::SERVICE_UNAVAILABLE,
                "Failed to set system health",
                Some(e.to_string()),
            ))
            .into_response()
        }
    }
}

/// POST /admin/config/reload
/// Re-reads the configuration file and swaps the identity directory in one
/// step. Store connection parameters are not re-applied; they only take
/// effect at startup.
pub async fn reload_config(State(s): State<Arc<AppState>>) -> Response {
    let Some(path) = s.config_path.as_deref() else {
        return ApiErrorType::from((
            StatusCode::BAD_REQUEST,
            "Running on the built-in configuration, nothing to reload",
            None,
        ))
        .into_response();
    };

    match LimiterConfig::load(Some(path)) {
        Ok(config) => {
            s.directory.replace(&config);
            let (api_keys, identities) = s.directory.counts();
            info!(api_keys, identities, "configuration reloaded");
            let body = json!({
                "reloaded": true,
                "api_keys": api_keys,
                "identities": identities,
            });
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => {
            error!("configuration reload failed: {}", e);
            ApiErrorType::from((
                StatusCode::INTERNAL_SERVER_ERROR,
                "Configuration reload failed, previous tables kept",
                Some(e.to_string()),
            ))
            .into_response()
        }
    }
}

/// GET /admin/identities/:identity/status
/// Current window counter plus the limit the identity would get right now.
pub async fn get_identity_status(
    Path(identity): Path<String>,
    State(s): State<Arc<AppState>>,
) -> Response {
    let Some((tier_name, limits)) = s.directory.tier_of(&identity) else {
        return ApiErrorType::from((StatusCode::NOT_FOUND, "Unknown identity", None))
            .into_response();
    };

    let status = match s.store.read_status(&identity, limits.window_seconds).await {
        Ok(status) => status,
        Err(e) => {
            error!("failed to read counter status for {}: {}", identity, e);
            return ApiErrorType::from((
                StatusCode::SERVICE_UNAVAILABLE,
                "Failed to read counter status",
                Some(e.to_string()),
            ))
            .into_response();
        }
    };

    let health = s.oracle.current().await;
    let limit = effective_limit(Tier::from_name(&tier_name), &limits, health);

    let body = json!({
        "identity": identity,
        "tier": tier_name,
        "system_health": health,
        "current_count": status.count,
        "effective_limit": limit,
        "remaining": limit.saturating_sub(status.count),
        "window_start": status.window_start,
        "window_end": status.window_end,
        "ttl": status.ttl,
        "tier_config": limits,
    });
    (StatusCode::OK, Json(body)).into_response()
}

/// POST /admin/identities/:identity/reset
/// Deletes every window counter for the identity across the store.
pub async fn reset_identity_counters(
    Path(identity): Path<String>,
    State(s): State<Arc<AppState>>,
) -> Response {
    match s.store.reset_counters(&identity).await {
        Ok(deleted) => {
            info!(%identity, deleted, "counters reset via admin surface");
            let body = json!({
                "identity": identity,
                "deleted_windows": deleted,
            });
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => {
            error!("failed to reset counters for {}: {}", identity, e);
            ApiErrorType::from((
                StatusCode::SERVICE_UNAVAILABLE,
                "Failed to reset counters",
                Some(e.to_string()),
            ))
            .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::create_router;
    use crate::store::mock::MockStore;
    use crate::store::SharedStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn router_with(store: Arc<MockStore>) -> axum::Router {
        let config = LimiterConfig::default();
        let state = Arc::new(AppState::new(&config, store, None));
        create_router(state)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_set_and_get_health_round_trip() {
        let store = Arc::new(MockStore::new());
        let router = router_with(store);

        let request = Request::builder()
            .method("POST")
            .uri("/admin/health")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"status": "DEGRADED", "updated_by": "oncall"}"#,
            ))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let request = Request::builder()
            .uri("/admin/health")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "DEGRADED");
        assert_eq!(body["updated_by"], "oncall");
    }

    #[tokio::test]
    async fn test_set_health_rejects_unknown_status() {
        let store = Arc::new(MockStore::new());
        let router = router_with(store);

        let request = Request::builder()
            .method("POST")
            .uri("/admin/health")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"status": "ON_FIRE"}"#))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_identity_status_reports_effective_limit() {
        let store = Arc::new(MockStore::new());
        store
            .check_and_increment("demo_free_user", 20, 60, crate::store::unix_now())
            .await
            .unwrap();
        let router = router_with(store);

        let request = Request::builder()
            .uri("/admin/identities/demo_free_user/status")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["tier"], "free");
        assert_eq!(body["current_count"], 1);
        // NORMAL health grants the burst limit.
        assert_eq!(body["effective_limit"], 20);
        assert_eq!(body["remaining"], 19);
    }

    #[tokio::test]
    async fn test_identity_status_unknown_identity() {
        let store = Arc::new(MockStore::new());
        let router = router_with(store);

        let request = Request::builder()
            .uri("/admin/identities/nobody/status")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_reset_deletes_window_counters() {
        let store = Arc::new(MockStore::new());
        let now = crate::store::unix_now();
        store
            .check_and_increment("demo_free_user", 20, 60, now)
            .await
            .unwrap();
        store
            .check_and_increment("demo_free_user", 20, 60, now)
            .await
            .unwrap();
        let router = router_with(store.clone());

        let request = Request::builder()
            .method("POST")
            .uri("/admin/identities/demo_free_user/reset")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["deleted_windows"], 1);

        let status = store.read_status("demo_free_user", 60).await.unwrap();
        assert_eq!(status.count, 0);
    }
}
