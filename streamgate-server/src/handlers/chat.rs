use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use streamgate_shared::models::{ChatRequest, ChatResponse, WorkflowRequest};

use crate::app_state::AppState;
use crate::http::{ApiError, AppResult};

/// `POST /api/chat` — accepts a submission and hands it to the workflow
/// tier. Nothing is written to the database here; the reply comes back as
/// fragments on the instance's response subject.
pub async fn chat_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> AppResult<(StatusCode, Json<ChatResponse>)> {
    let Json(request) =
        payload.map_err(|err| ApiError::bad_request(format!("invalid request body: {err}")))?;

    if request.session_id.is_empty() || request.user_id.is_empty() || request.message.is_empty() {
        return Err(ApiError::bad_request(
            "session_id, user_id and message are required",
        ));
    }

    let message_id = Uuid::new_v4().to_string();
    let correlation_id = Uuid::new_v4().to_string();

    let mut context = request.context.unwrap_or_default();
    if let Some(provider) = request.ai_provider {
        context.insert("ai_provider".into(), json!(provider));
        context.insert("model".into(), json!(request.model.unwrap_or_default()));
    }

    let workflow = WorkflowRequest {
        message_id: message_id.clone(),
        session_id: request.session_id.clone(),
        user_id: request.user_id,
        message: request.message,
        context,
        timestamp: Utc::now(),
        correlation_id: correlation_id.clone(),
    };

    if !state.bus.is_connected() {
        return Err(ApiError::service_unavailable("message bus unavailable"));
    }
    state.bus.publish_workflow(&workflow).await.map_err(|err| {
        error!(
            session_id = %workflow.session_id,
            message_id,
            error = %err,
            "failed to publish workflow request"
        );
        ApiError::service_unavailable("failed to hand submission to the workflow tier")
    })?;

    info!(
        session_id = %workflow.session_id,
        message_id,
        correlation_id,
        "chat submission accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(ChatResponse {
            message_id,
            session_id: request.session_id,
            status: "accepted".into(),
            timestamp: Utc::now(),
            correlation_id,
        }),
    ))
}
