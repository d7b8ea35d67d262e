use anyhow::{Context, Result};
use async_nats::connection::State;
use async_nats::{Event, Subscriber};
use async_trait::async_trait;
use tracing::{debug, info, warn};

use streamgate_shared::config::NatsConfig;
use streamgate_shared::models::WorkflowRequest;

/// Seam between the HTTP surface and the broker, so handlers can be tested
/// with an in-memory double.
#[async_trait]
pub trait WorkflowBus: Send + Sync {
    async fn publish_workflow(&self, request: &WorkflowRequest) -> Result<()>;
    fn is_connected(&self) -> bool;
}

/// NATS-backed bus client for one edge instance.
pub struct NatsBus {
    client: async_nats::Client,
    pod_id: String,
}

impl NatsBus {
    /// Connects to the broker; the initial connection is fatal on failure,
    /// after which the client reconnects on its own with a fixed backoff.
    pub async fn connect(config: &NatsConfig, pod_id: &str) -> Result<Self> {
        let reconnect_wait = config.reconnect_wait;
        let client = async_nats::ConnectOptions::new()
            .max_reconnects(config.reconnect_limit())
            .reconnect_delay_callback(move |_attempts| reconnect_wait)
            .event_callback(|event| async move {
                match event {
                    Event::Connected => info!("nats connection restored"),
                    Event::Disconnected => warn!("nats connection lost"),
                    other => debug!(event = %other, "nats client event"),
                }
            })
            .connect(&config.url)
            .await
            .with_context(|| format!("failed to connect to NATS at {}", config.url))?;

        info!(url = %config.url, pod_id, "connected to NATS");
        Ok(Self {
            client,
            pod_id: pod_id.to_string(),
        })
    }

    /// Fragments addressed to this instance by the workflow tier.
    pub async fn subscribe_responses(&self) -> Result<Subscriber> {
        let subject = format!("chat.pod.{}.response", self.pod_id);
        let subscriber = self
            .client
            .subscribe(subject.clone())
            .await
            .with_context(|| format!("failed to subscribe to {subject}"))?;
        info!(subject, "subscribed");
        Ok(subscriber)
    }

    /// Fallback fan-in for producers that could not resolve instance
    /// ownership; the consumer must filter by live sessions.
    pub async fn subscribe_broadcast(&self) -> Result<Subscriber> {
        let subject = "chat.session.*.broadcast";
        let subscriber = self
            .client
            .subscribe(subject)
            .await
            .with_context(|| format!("failed to subscribe to {subject}"))?;
        info!(subject, "subscribed");
        Ok(subscriber)
    }

    /// Flushes pending publishes and unsubscribes everything before exit.
    pub async fn drain(&self) -> Result<()> {
        self.client
            .drain()
            .await
            .context("failed to drain NATS connection")
    }
}

#[async_trait]
impl WorkflowBus for NatsBus {
    async fn publish_workflow(&self, request: &WorkflowRequest) -> Result<()> {
        let subject = format!("chat.workflow.execute.{}", request.session_id);
        let payload = serde_json::to_vec(request).context("failed to encode workflow request")?;

        self.client
            .publish(subject.clone(), payload.into())
            .await
            .with_context(|| format!("failed to publish workflow request to {subject}"))?;
        self.client
            .flush()
            .await
            .context("failed to flush workflow request")?;

        metrics::counter!("workflow_requests_published_total").increment(1);
        debug!(subject, message_id = %request.message_id, "published workflow request");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.connection_state() == State::Connected
    }
}
