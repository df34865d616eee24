// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// `GET /api/health` is public. `GET /api/status` requires a Bearer token
// checked via the `AuthBearer` extractor. The WebSocket upgrade lives in
// `ws.rs` but is mounted here alongside the REST routes.
// =============================================================================

use axum::{
    extract::State,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use super::auth::AuthBearer;
use super::ApiState;
use crate::status::StatusProvider;

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/ws", get(super::ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok", server_time: chrono::Utc::now().timestamp_millis() })
}

async fn status(_auth: AuthBearer, State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.status.status().await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_response_is_ok() {
        let resp = health().await.into_response();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);
    }
}
