use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::StreamExt;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{fmt, EnvFilter};

use streamgate_shared::config::{Config, LogFormat};
use streamgate_shared::models::ResponseChunk;

use crate::app_state::AppState;
use crate::routes;
use crate::services::buffer::BufferManager;
use crate::services::bus::NatsBus;
use crate::services::directory::RedisDirectory;
use crate::services::ingest::IngestPipeline;
use crate::services::persistence::{MessageSink, NullMessageSink, PgMessageSink};
use crate::services::stream_hub::StreamHub;
use crate::tracer;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Instance-wide SSE ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Upper bound on the post-shutdown drain sequence.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

pub fn metrics_handle() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

async fn metrics_endpoint() -> impl IntoResponse {
    let handle = metrics_handle();
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        handle.render(),
    )
}

/// Initializes the tracing subscriber from the logging configuration.
pub fn initialize_tracing(config: &Config) {
    let env_filter = build_env_filter(config);
    if matches!(config.logging.format, LogFormat::Json) {
        let _ = fmt::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_level(true)
            .json()
            .with_ansi(false)
            .try_init();
    } else {
        let _ = fmt::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_level(true)
            .with_ansi(true)
            .try_init();
    }
}

fn build_env_filter(config: &Config) -> EnvFilter {
    let default_level = config
        .logging
        .level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);

    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::builder()
            .with_default_directive(default_level.into())
            .from_env_lossy()
    })
}

/// Permissive CORS for browser clients behind arbitrary origins.
pub fn create_cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods(AllowMethods::list([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ]))
        .allow_headers(AllowHeaders::list([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
        ]))
}

/// Builds the full application router with middleware applied.
pub fn create_app_router(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api", routes::create_api_router(&state))
        .merge(routes::create_root_router(&state))
        .route("/metrics", get(metrics_endpoint))
        .layer(create_cors_layer())
        .layer(tracer::create_trace_layer())
        .with_state(state)
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("shutdown signal received");
}

fn spawn_ingest_loop(
    mut subscriber: async_nats::Subscriber,
    pipeline: Arc<IngestPipeline>,
    broadcast: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = subscriber.next().await {
            match serde_json::from_slice::<ResponseChunk>(&message.payload) {
                Ok(chunk) => {
                    if broadcast {
                        pipeline.handle_broadcast(chunk);
                    } else {
                        pipeline.handle_chunk(chunk);
                    }
                }
                Err(err) => {
                    warn!(
                        subject = %message.subject,
                        error = %err,
                        "skipping undecodable fragment payload"
                    );
                    metrics::counter!("chunks_dropped_total", "reason" => "decode").increment(1);
                }
            }
        }
        info!(broadcast, "fragment subscription closed");
    })
}

fn spawn_sweeper(buffers: Arc<BufferManager>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for evicted in buffers.sweep() {
                warn!(
                    message_id = %evicted.message_id,
                    session_id = %evicted.session_id,
                    reason = evicted.reason.as_str(),
                    received = evicted.received,
                    emitted = evicted.emitted,
                    "evicted reorder buffer"
                );
            }
        }
    })
}

fn spawn_ping(streams: Arc<StreamHub>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(PING_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The immediate first tick would ping streams that just connected.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            streams.broadcast_ping();
        }
    })
}

/// Starts the edge instance and blocks until shutdown completes.
///
/// Fatal errors (config, Redis connect, NATS connect, bind) propagate to
/// the caller so the process exits non-zero.
pub async fn run(config: Config) -> Result<()> {
    initialize_tracing(&config);
    let _ = metrics_handle();

    let config = Arc::new(config);
    let pod_id = config.server.pod_id.clone();
    info!(pod_id, "starting streamgate edge instance");

    let directory = Arc::new(RedisDirectory::connect(&config.redis).await?);
    let bus = Arc::new(NatsBus::connect(&config.nats, &pod_id).await?);

    let sink: Arc<dyn MessageSink> = match config.database.url.as_deref() {
        Some(url) => {
            info!("message persistence enabled");
            Arc::new(PgMessageSink::connect_lazy(url)?)
        }
        None => {
            info!("DATABASE_URL not set, finalized messages will not be persisted");
            Arc::new(NullMessageSink)
        }
    };

    let streams = Arc::new(StreamHub::new());
    let buffers = Arc::new(BufferManager::new(config.buffer.clone()));
    let pipeline = Arc::new(IngestPipeline::new(
        buffers.clone(),
        streams.clone(),
        sink,
    ));

    let responses = bus.subscribe_responses().await?;
    let broadcasts = bus.subscribe_broadcast().await?;
    let response_task = spawn_ingest_loop(responses, pipeline.clone(), false);
    let broadcast_task = spawn_ingest_loop(broadcasts, pipeline, true);

    let sweeper_task = spawn_sweeper(buffers.clone(), config.buffer.cleanup_interval);
    let ping_task = spawn_ping(streams.clone());

    let state = Arc::new(AppState {
        config: config.clone(),
        pod_id,
        bus: bus.clone(),
        directory,
        streams: streams.clone(),
        buffers,
    });

    let app = create_app_router(state);
    let addr = config.server.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    // Teardown order: the acceptor is already stopped; drain the bus so the
    // ingest loops finish, stop the periodic tasks, then drop the streams.
    info!("draining");
    let drain = async {
        if let Err(err) = bus.drain().await {
            warn!(error = %err, "failed to drain NATS connection");
        }
        let _ = response_task.await;
        let _ = broadcast_task.await;
        sweeper_task.abort();
        ping_task.abort();
        streams.close_all();
    };
    if time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        warn!("graceful drain timed out");
    }

    info!("server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testutil::{test_state, FakeBus};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn metrics_endpoint_serves_prometheus_exposition() {
        let _ = metrics_handle();
        let state = test_state(Arc::new(FakeBus::healthy()));
        let app = create_app_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain; version=0.0.4"
        );
    }

    #[tokio::test]
    async fn cors_preflight_is_permissive() {
        let state = test_state(Arc::new(FakeBus::healthy()));
        let app = create_app_router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/api/chat")
                    .header("origin", "https://example.test")
                    .header("access-control-request-method", "POST")
                    .header("access-control-request-headers", "content-type")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get("access-control-allow-origin")
                .unwrap(),
            "*"
        );
        let methods = response
            .headers()
            .get("access-control-allow-methods")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(methods.contains("POST"));
    }

    #[tokio::test]
    async fn full_router_serves_health_and_404() {
        let state = test_state(Arc::new(FakeBus::healthy()));
        let app = create_app_router(state);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
