//! Rate-limiting middleware: the request entry and exit point.
//!
//! Per request, in this order: exclusion check, source-block check,
//! identity resolution, then the admission engine (health, policy,
//! counter). Skipping an earlier check is never allowed. Admitted requests
//! are forwarded with the decision attached to request extensions and the
//! rate-limit headers stamped on the response.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::abuse::AbuseVerdict;
use crate::engine::{resolve_identity, AdmissionDecision, IdentityError, KeyDigest};
use crate::store::unix_now;
use crate::types::AppState;

const HEADER_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
const HEADER_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
const HEADER_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
const HEADER_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Request id attached to request extensions for downstream handlers.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// The admission gate. Layered over every route; excluded paths bypass all
/// core logic and receive no headers from it.
pub async fn rate_limit_gate(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let path = request.uri().path().to_string();

    if state.exclusions.matches(&path) {
        debug!(%request_id, %path, "path excluded from rate limiting");
        return next.run(request).await;
    }

    let source = client_source(&request);
    info!(
        %request_id,
        method = %request.method(),
        %path,
        %source,
        "request received"
    );

    if state.abuse.is_blocked(&source).await {
        warn!(%request_id, %source, "blocked source attempted access");
        return blocked_response(&request_id, state.abuse.block_duration_seconds());
    }

    let raw_key = request
        .headers()
        .get(state.key_header.as_str())
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string());

    let resolved = match resolve_identity(raw_key.as_deref(), &state.directory) {
        Ok(resolved) => resolved,
        Err(err) => {
            match raw_key.as_deref() {
                Some(key) => warn!(
                    %request_id,
                    %source,
                    key = %KeyDigest::of(key),
                    error_code = err.error_code(),
                    "identity resolution failed"
                ),
                None => warn!(
                    %request_id,
                    %source,
                    error_code = err.error_code(),
                    "identity resolution failed"
                ),
            }
            return match state.abuse.record_failed_attempt(&source).await {
                AbuseVerdict::Blocked => {
                    blocked_response(&request_id, state.abuse.block_duration_seconds())
                }
                AbuseVerdict::Tolerated => identity_error_response(err, &request_id),
            };
        }
    };

    let decision = state.engine.admit(&resolved).await;

    if !decision.admitted {
        warn!(
            %request_id,
            identity = %decision.identity,
            tier = %decision.tier,
            limit = decision.limit,
            reset_at = decision.reset_at,
            "rate limit exceeded"
        );
        return rate_limited_response(&decision, &request_id);
    }

    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));
    request.extensions_mut().insert(decision.clone());

    let mut response = next.run(request).await;
    apply_rate_limit_headers(response.headers_mut(), &decision);
    set_request_id(response.headers_mut(), &request_id);

    debug!(
        %request_id,
        identity = %decision.identity,
        remaining = decision.remaining,
        status = %response.status(),
        "request admitted"
    );

    response
}

/// Derives the source identifier used for abuse counting: the first
/// `X-Forwarded-For` entry, then `X-Real-IP`, then the transport peer.
fn client_source(request: &Request) -> String {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real_ip) = request
        .headers()
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
    {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn identity_error_response(err: IdentityError, request_id: &str) -> Response {
    let body = json!({
        "error": err.message(),
        "error_code": err.error_code(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "request_id": request_id,
    });
    let mut response = (err.status(), Json(body)).into_response();
    set_request_id(response.headers_mut(), request_id);
    response
}

fn blocked_response(request_id: &str, retry_after: u64) -> Response {
    let body = json!({
        "error": "Source address is temporarily blocked due to abuse.",
        "error_code": "IP_BLOCKED",
        "retry_after": retry_after,
        "request_id": request_id,
    });
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    response
        .headers_mut()
        .insert(RETRY_AFTER, header_value(retry_after));
    set_request_id(response.headers_mut(), request_id);
    response
}

fn rate_limited_response(decision: &AdmissionDecision, request_id: &str) -> Response {
    let retry_after = decision.retry_after(unix_now());
    let body = json!({
        "error": "Rate limit exceeded",
        "error_code": "RATE_LIMIT_EXCEEDED",
        "message": format!(
            "You have exceeded the rate limit of {} requests per window.",
            decision.limit
        ),
        "retry_after": retry_after,
        "request_id": request_id,
    });
    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    apply_rate_limit_headers(response.headers_mut(), decision);
    response
        .headers_mut()
        .insert(RETRY_AFTER, header_value(retry_after));
    set_request_id(response.headers_mut(), request_id);
    response
}

fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &AdmissionDecision) {
    headers.insert(HEADER_LIMIT, header_value(decision.limit));
    headers.insert(HEADER_REMAINING, header_value(decision.remaining));
    headers.insert(HEADER_RESET, header_value(decision.reset_at));
}

fn set_request_id(headers: &mut HeaderMap, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(HEADER_REQUEST_ID, value);
    }
}

fn header_value(value: u64) -> HeaderValue {
    // Decimal digits are always valid header content.
    HeaderValue::from_str(&value.to_string()).unwrap_or(HeaderValue::from_static("0"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimiterConfig;
    use crate::store::mock::MockStore;
    use crate::store::SharedStore;
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    fn test_config() -> LimiterConfig {
        let json = r#"{
            "tiers": {
                "free": {"base_limit": 2, "burst_limit": 3, "degraded_limit": 1}
            },
            "identities": {"alice": "free"},
            "api_keys": {"alice_key_0001": "alice"},
            "exclude_paths": ["/health", "/admin/*"]
        }"#;
        serde_json::from_str(json).unwrap()
    }

    fn test_router(store: Arc<MockStore>) -> Router {
        let state = Arc::new(AppState::new(&test_config(), store, None));
        Router::new()
            .route("/api/ping", get(|| async { "pong" }))
            .route("/health", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(state, rate_limit_gate))
    }

    fn request(path: &str, key: Option<&str>, source: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .uri(path)
            .header("x-forwarded-for", source);
        if let Some(key) = key {
            builder = builder.header("X-API-Key", key);
        }
        builder.body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_excluded_path_touches_nothing() {
        let store = Arc::new(MockStore::new());
        let router = test_router(store.clone());

        let response = router
            .oneshot(request("/health", None, "1.2.3.4"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
        assert!(response.headers().get("x-request-id").is_none());
        assert_eq!(store.call_count(), 0);
    }

    #[tokio::test]
    async fn test_admitted_request_carries_headers() {
        let store = Arc::new(MockStore::new());
        let router = test_router(store);

        let response = router
            .oneshot(request("/api/ping", Some("alice_key_0001"), "1.2.3.4"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        // Burst limit applies under NORMAL health.
        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "3");
        assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "2");
        assert!(headers.get("x-ratelimit-reset").is_some());
        assert!(headers.get("x-request-id").is_some());
    }

    #[tokio::test]
    async fn test_over_limit_returns_429_with_headers() {
        let store = Arc::new(MockStore::new());
        let router = test_router(store);

        for _ in 0..3 {
            let response = router
                .clone()
                .oneshot(request("/api/ping", Some("alice_key_0001"), "1.2.3.4"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = router
            .oneshot(request("/api/ping", Some("alice_key_0001"), "1.2.3.4"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get("x-ratelimit-remaining").unwrap(),
            "0"
        );
        let retry_after: u64 = response
            .headers()
            .get("retry-after")
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry_after >= 1);

        let body = body_json(response).await;
        assert_eq!(body["error_code"], "RATE_LIMIT_EXCEEDED");
        assert!(body["request_id"].is_string());
    }

    #[tokio::test]
    async fn test_missing_key_is_401() {
        let store = Arc::new(MockStore::new());
        let router = test_router(store);

        let response = router
            .oneshot(request("/api/ping", None, "1.2.3.4"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["error_code"], "MISSING_API_KEY");
    }

    #[tokio::test]
    async fn test_malformed_key_is_400() {
        let store = Arc::new(MockStore::new());
        let router = test_router(store);

        let response = router
            .oneshot(request("/api/ping", Some("bad key!"), "1.2.3.4"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error_code"], "MALFORMED_API_KEY");
    }

    #[tokio::test]
    async fn test_repeated_invalid_keys_block_the_source() {
        let store = Arc::new(MockStore::new());
        let router = test_router(store);

        // Ten invalid attempts are tolerated with the original error.
        for _ in 0..10 {
            let response = router
                .clone()
                .oneshot(request("/api/ping", Some("nosuchkey_0001"), "1.2.3.4"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            let body = body_json(response).await;
            assert_eq!(body["error_code"], "INVALID_API_KEY");
        }

        // The eleventh trips the block.
        let response = router
            .clone()
            .oneshot(request("/api/ping", Some("nosuchkey_0001"), "1.2.3.4"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = body_json(response).await;
        assert_eq!(body["error_code"], "IP_BLOCKED");

        // Even a valid key is refused from the blocked source.
        let response = router
            .oneshot(request("/api/ping", Some("alice_key_0001"), "1.2.3.4"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = body_json(response).await;
        assert_eq!(body["error_code"], "IP_BLOCKED");
    }

    #[tokio::test]
    async fn test_other_sources_unaffected_by_block() {
        let store = Arc::new(MockStore::new());
        let router = test_router(store);

        for _ in 0..11 {
            router
                .clone()
                .oneshot(request("/api/ping", Some("nosuchkey_0001"), "1.2.3.4"))
                .await
                .unwrap();
        }

        let response = router
            .oneshot(request("/api/ping", Some("alice_key_0001"), "5.6.7.8"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_counter_outage_fails_open_for_authenticated() {
        let store = Arc::new(MockStore::new());
        store.fail_counters();
        let router = test_router(store);

        let response = router
            .oneshot(request("/api/ping", Some("alice_key_0001"), "1.2.3.4"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "1");
        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "3");
    }

    #[tokio::test]
    async fn test_store_outage_fails_closed_for_unauthenticated() {
        let store = Arc::new(MockStore::new());
        store.fail_abuse();
        let router = test_router(store);

        let response = router
            .oneshot(request("/api/ping", Some("nosuchkey_0001"), "1.2.3.4"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = body_json(response).await;
        assert_eq!(body["error_code"], "IP_BLOCKED");
    }

    #[tokio::test]
    async fn test_x_real_ip_fallback() {
        let store = Arc::new(MockStore::new());
        let router = test_router(store.clone());

        let req = Request::builder()
            .uri("/api/ping")
            .header("x-real-ip", "9.9.9.9")
            .header("X-API-Key", "nosuchkey_0001")
            .body(Body::empty())
            .unwrap();
        router.oneshot(req).await.unwrap();

        // The failed attempt was counted against the X-Real-IP source.
        for _ in 0..10 {
            store.bump_abuse("9.9.9.9", 300).await.unwrap();
        }
        assert_eq!(store.bump_abuse("9.9.9.9", 300).await.unwrap(), 12);
    }
}
