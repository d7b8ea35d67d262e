use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

use crate::app_state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub pod_id: String,
    pub timestamp: i64,
    pub active_connections: usize,
    pub active_sessions: usize,
    pub active_buffers: usize,
    pub nats_connected: bool,
}

/// `GET /health` — liveness snapshot of this instance.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        pod_id: state.pod_id.clone(),
        timestamp: Utc::now().timestamp(),
        active_connections: state.streams.connection_count(),
        active_sessions: state.streams.session_count(),
        active_buffers: state.buffers.len(),
        nats_connected: state.bus.is_connected(),
    })
}

/// `GET /` — service banner.
pub async fn service_banner(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "service": "streamgate",
        "version": env!("CARGO_PKG_VERSION"),
        "pod_id": state.pod_id,
    }))
}
