use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{debug, warn};

use streamgate_shared::models::Message;

const STORE_ATTEMPTS: u32 = 3;
const STORE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Hand-off point for finalized messages.
///
/// The SSE contract is independent of durable storage: implementations
/// absorb their own failures (with bounded retries) and the caller only
/// logs the final outcome.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn store(&self, message: &Message) -> Result<()>;
}

/// Writes finalized messages to the platform's relational store.
pub struct PgMessageSink {
    pool: PgPool,
}

impl PgMessageSink {
    /// The pool is lazy: the edge stays up while the store is down and the
    /// sink retries per message instead.
    pub fn connect_lazy(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(url)
            .context("invalid database URL")?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl MessageSink for PgMessageSink {
    async fn store(&self, message: &Message) -> Result<()> {
        let mut last_error = None;
        for attempt in 1..=STORE_ATTEMPTS {
            let result = sqlx::query(
                "INSERT INTO messages \
                 (message_id, session_id, role, content, token_count, metadata, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 ON CONFLICT (message_id) DO NOTHING",
            )
            .bind(&message.message_id)
            .bind(&message.session_id)
            .bind(&message.role)
            .bind(&message.content)
            .bind(i64::from(message.token_count))
            .bind(sqlx::types::Json(&message.metadata))
            .bind(message.created_at)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => {
                    debug!(message_id = %message.message_id, "persisted finalized message");
                    metrics::counter!("messages_persisted_total").increment(1);
                    return Ok(());
                }
                Err(err) => {
                    warn!(
                        message_id = %message.message_id,
                        attempt,
                        error = %err,
                        "failed to persist finalized message"
                    );
                    last_error = Some(err);
                    if attempt < STORE_ATTEMPTS {
                        tokio::time::sleep(STORE_RETRY_DELAY).await;
                    }
                }
            }
        }

        metrics::counter!("messages_persist_failures_total").increment(1);
        Err(last_error
            .map(anyhow::Error::from)
            .unwrap_or_else(|| anyhow::anyhow!("message persistence failed")))
    }
}

/// Sink used when no database is configured: the finalized message is only
/// logged.
pub struct NullMessageSink;

#[async_trait]
impl MessageSink for NullMessageSink {
    async fn store(&self, message: &Message) -> Result<()> {
        debug!(
            message_id = %message.message_id,
            session_id = %message.session_id,
            chars = message.content.len(),
            tokens = message.token_count,
            "finalized message discarded (no persistence configured)"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn null_sink_accepts_everything() {
        let sink = NullMessageSink;
        let message = Message {
            message_id: "m-1".into(),
            session_id: "s-1".into(),
            role: "assistant".into(),
            content: "abc".into(),
            token_count: 3,
            metadata: None,
            created_at: Utc::now(),
        };

        assert!(sink.store(&message).await.is_ok());
    }

    #[test]
    fn lazy_pool_rejects_malformed_urls() {
        assert!(PgMessageSink::connect_lazy("not-a-url").is_err());
    }
}
