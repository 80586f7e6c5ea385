//! # ohgrt_api
//!
//! HTTP API library for OhGrt: the request-boundary middleware stack
//! (correlation id, rate limiting, security gate, authentication) and the
//! session and health endpoints.

pub mod config;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;

use std::sync::Arc;

use axum::Router;
use axum::http::HeaderName;
use axum::routing::{get, post};
use ohgrt_core::SecurityContext;
use sqlx::PgPool;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::handlers::{auth, health, whoami};

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    /// API configuration.
    pub config: ApiConfig,
    /// Security collaborators, built once at startup.
    pub security: Arc<SecurityContext>,
    /// PostgreSQL connection pool. `None` runs without a database.
    pub pool: Option<PgPool>,
}

/// Run embedded database migrations.
///
/// Delegates to `ohgrt_core::migrate::migrate()` which owns the migration files.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    ohgrt_core::migrate::migrate(pool).await
}

/// Builds the Axum router with all routes and shared state.
pub fn router(state: AppState) -> Router {
    let exposed: [HeaderName; 5] = [
        middleware::X_REQUEST_ID,
        middleware::X_CORRELATION_ID,
        middleware::X_RATELIMIT_LIMIT,
        middleware::X_RATELIMIT_REMAINING,
        middleware::X_RATELIMIT_RESET,
    ];
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(exposed);

    // Public routes (no auth required)
    let public = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/auth/refresh", post(auth::refresh_handler))
        .route("/auth/logout", post(auth::logout_handler));

    // Optional auth: anonymous allowed, bad credentials rejected
    let optional = Router::new()
        .route("/api/whoami", get(whoami::whoami_handler))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::optional_auth,
        ));

    // Protected routes (require auth)
    let protected = Router::new()
        .route("/auth/me", get(auth::me_handler))
        .route("/auth/logout-all", post(auth::logout_all_handler))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::require_auth,
        ));

    // Layers run bottom-up on the way in: CORS, tracing, correlation id,
    // security gate, then the rate limit. Gate rejections never count
    // against a client's quota.
    Router::new()
        .merge(public)
        .merge(optional)
        .merge(protected)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::rate_limit::rate_limit,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::security::verify_request,
        ))
        .layer(axum::middleware::from_fn(
            middleware::correlation::correlation_id,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
