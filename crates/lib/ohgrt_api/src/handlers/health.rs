//! Liveness and readiness probes.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ohgrt_core::store::ConnectionState;
use tracing::warn;

use crate::AppState;
use crate::models::{HealthResponse, ReadinessResponse};

/// `GET /health`
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: ohgrt_core::version(),
    })
}

/// `GET /health/live`
pub async fn liveness() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "alive",
        version: ohgrt_core::version(),
    })
}

/// `GET /health/ready`: database reachable and, when memory fallback is
/// disabled, Redis connected.
pub async fn readiness(State(state): State<AppState>) -> Response {
    let database = match &state.pool {
        Some(pool) => {
            let ok = sqlx::query("SELECT 1").execute(pool).await.is_ok();
            if !ok {
                warn!("Readiness check: database unreachable");
            }
            Some(ok)
        }
        None => None,
    };

    let connection = state.security.store.connection_state().await;
    let store_ready = match &connection {
        None | Some(ConnectionState::Connected) => true,
        Some(_) => state.security.settings.store.allow_memory_fallback,
    };
    let store = connection
        .as_ref()
        .map_or("memory", ConnectionState::as_str)
        .to_string();

    let ready = database.unwrap_or(true) && store_ready;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = ReadinessResponse {
        status: if ready { "ready" } else { "not_ready" },
        database,
        store,
    };
    (status, Json(body)).into_response()
}
