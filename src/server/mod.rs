use std::sync::Arc;

use axum::routing::{get, post};
use axum::{middleware as mw, Router};

use crate::server::endpoints::{admin, demo, status};
use crate::types::AppState;

mod endpoints;
pub mod exclude;
mod middleware;
mod types;

/// Creates a router that can be used by `axum`.
///
/// Every route sits behind the rate-limiting gate; the paths on the
/// configured exclusion list (by default `/`, `/health`, and `/admin/*`)
/// bypass it at runtime.
///
/// # Parameters
/// - `app_state`: The shared application state.
///
/// # Returns
/// The router.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    // Administrative surface: direct library calls on the oracle, the
    // directory, and the store.
    let admin_router = Router::new()
        .route(
            "/health",
            get(admin::get_system_health).post(admin::set_system_health),
        )
        .route("/config/reload", post(admin::reload_config))
        .route(
            "/identities/:identity/status",
            get(admin::get_identity_status),
        )
        .route(
            "/identities/:identity/reset",
            post(admin::reset_identity_counters),
        );

    Router::new()
        .route("/", get(status::get_root))
        .route("/health", get(status::get_health))
        .route("/api/ping", get(demo::get_ping))
        .nest("/admin", admin_router)
        .layer(mw::from_fn_with_state(
            app_state.clone(),
            middleware::rate_limit_gate,
        ))
        .with_state(app_state)
}
