use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::timeout::TimeoutLayer;

use crate::app_state::AppState;
use crate::handlers::{chat, health, sse};

/// API routes under `/api`. The submit route carries the request timeout;
/// the SSE route must never be timed out.
pub fn create_api_router(state: &Arc<AppState>) -> Router<Arc<AppState>> {
    let read_timeout = state.config.server.read_timeout;

    Router::new()
        .route(
            "/chat",
            post(chat::chat_handler).layer(TimeoutLayer::new(read_timeout)),
        )
        .route("/sse", get(sse::sse_handler))
}

/// Top-level routes: health, banner and the JSON 404 fallback.
pub fn create_root_router(state: &Arc<AppState>) -> Router<Arc<AppState>> {
    let read_timeout = state.config.server.read_timeout;

    Router::new()
        .route(
            "/health",
            get(health::health_handler).layer(TimeoutLayer::new(read_timeout)),
        )
        .route("/", get(health::service_banner))
        .fallback(not_found)
}

async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "not_found", "message": "resource not found" })),
    )
}
