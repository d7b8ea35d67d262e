use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::header::{self, HeaderName};
use axum::http::HeaderMap;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio::time::{self, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use streamgate_shared::models::ActiveConnection;

use crate::app_state::AppState;
use crate::http::{ApiError, AppResult};
use crate::services::stream_hub::{SseFrame, StreamRecord};

/// Cadence of per-stream liveness refreshes in the session directory; must
/// stay well inside the 30 s heartbeat-key TTL.
const LIVENESS_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
pub struct SseQuery {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

/// `GET /api/sse?session_id=…&user_id=…` — one long-lived event stream per
/// subscriber. The handler registers the stream locally and in the cluster
/// directory, emits `connected`, and then the reorder pipeline owns the
/// channel until the client goes away.
pub async fn sse_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SseQuery>,
    headers: HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> AppResult<impl IntoResponse> {
    let session_id = query
        .session_id
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing session_id parameter"))?;
    let user_id = query
        .user_id
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::bad_request("missing user_id parameter"))?;

    let client_ip = connect_info.map(|ConnectInfo(addr)| addr.to_string());
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let (record, receiver) = state
        .streams
        .add(&session_id, &user_id, client_ip.clone(), user_agent.clone());

    let registration = ActiveConnection {
        connection_id: record.id.to_string(),
        session_id: session_id.clone(),
        pod_id: state.pod_id.clone(),
        user_id,
        connected_at: record.created_at,
        last_heartbeat: Utc::now(),
        client_ip,
        user_agent,
    };

    // A directory failure leaves the stream usable; direct-subject routing
    // degrades to the broadcast fallback until the next heartbeat lands.
    if let Err(err) = state.directory.register(&registration).await {
        warn!(
            stream_id = %record.id,
            session_id,
            error = %err,
            "failed to register stream in session directory"
        );
    }

    info!(stream_id = %record.id, session_id, "subscriber stream established");

    state.streams.send_to_stream(
        record.id,
        SseFrame::new(
            "connected",
            json!({
                "connection_id": record.id,
                "session_id": session_id,
            }),
        ),
    );

    spawn_stream_keeper(state, record, registration);

    let stream = ReceiverStream::new(receiver).map(frame_to_event);
    Ok((
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(stream),
    ))
}

fn frame_to_event(frame: SseFrame) -> Result<Event, Infallible> {
    Ok(Event::default()
        .event(frame.event)
        .data(frame.data.to_string()))
}

/// Owns the stream's directory liveness and its teardown: refreshes the
/// heartbeat every ten seconds and deregisters from both the hub and the
/// directory once the subscriber channel closes.
fn spawn_stream_keeper(
    state: Arc<AppState>,
    record: Arc<StreamRecord>,
    registration: ActiveConnection,
) {
    tokio::spawn(async move {
        let mut ticker = time::interval(LIVENESS_REFRESH_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = state.directory.heartbeat(&registration).await {
                        warn!(
                            stream_id = %record.id,
                            error = %err,
                            "failed to refresh stream liveness"
                        );
                    }
                }
                () = record.closed() => break,
            }
        }

        state.streams.remove(record.id);
        if let Err(err) = state.directory.deregister(&registration).await {
            warn!(
                stream_id = %record.id,
                error = %err,
                "failed to deregister stream from session directory"
            );
        }
        info!(
            stream_id = %record.id,
            session_id = %record.session_id,
            "subscriber stream closed"
        );
    });
}
