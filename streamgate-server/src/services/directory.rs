use std::collections::{BTreeSet, HashMap};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info};

use streamgate_shared::config::RedisConfig;
use streamgate_shared::models::ActiveConnection;

/// TTL on session membership sets and per-instance stream maps; renewed on
/// every heartbeat, so expiry only fires after a crash.
const MEMBERSHIP_TTL_SECS: i64 = 300;
/// TTL on the per-stream liveness key; refreshed every ten seconds.
const HEARTBEAT_TTL_SECS: u64 = 30;
/// TTL on cached per-session metadata.
const SESSION_META_TTL_SECS: i64 = 3600;

/// Cluster-wide session directory.
///
/// All values are plain ASCII strings so producer tiers written in other
/// languages can read them.
#[async_trait]
pub trait SessionDirectory: Send + Sync {
    async fn register(&self, conn: &ActiveConnection) -> Result<()>;
    async fn deregister(&self, conn: &ActiveConnection) -> Result<()>;
    async fn heartbeat(&self, conn: &ActiveConnection) -> Result<()>;
    /// Instance ids currently streaming the session.
    async fn active_instances(&self, session_id: &str) -> Result<Vec<String>>;
    /// stream id -> session id map for one instance.
    async fn streams_of(&self, pod_id: &str) -> Result<HashMap<String, String>>;
    async fn cache_session_meta(
        &self,
        session_id: &str,
        meta: &HashMap<String, String>,
    ) -> Result<()>;
    async fn session_meta(&self, session_id: &str) -> Result<HashMap<String, String>>;
}

/// Redis-backed directory shared by all edge instances.
pub struct RedisDirectory {
    conn: ConnectionManager,
}

impl RedisDirectory {
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let url = config.url();
        let client = redis::Client::open(url.as_str())
            .with_context(|| format!("invalid Redis URL for {}:{}", config.host, config.port))?;
        let mut conn = ConnectionManager::new(client)
            .await
            .with_context(|| format!("failed to connect to Redis at {}:{}", config.host, config.port))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis ping failed")?;

        info!(host = %config.host, port = config.port, "connected to Redis");
        Ok(Self { conn })
    }
}

fn session_key(session_id: &str) -> String {
    format!("session:connections:{session_id}")
}

fn pod_key(pod_id: &str) -> String {
    format!("pod:connections:{pod_id}")
}

fn heartbeat_key(pod_id: &str, connection_id: &str) -> String {
    format!("heartbeat:{pod_id}:{connection_id}")
}

fn meta_key(session_id: &str) -> String {
    format!("session:meta:{session_id}")
}

/// Extracts the instance id from a `<instance>:<stream>` membership marker.
///
/// Stream ids are opaque, so the split happens at the last colon; instance
/// ids may themselves contain colons.
fn instance_of(member: &str) -> Option<&str> {
    member
        .rsplit_once(':')
        .map(|(instance, _)| instance)
        .filter(|instance| !instance.is_empty())
}

#[async_trait]
impl SessionDirectory for RedisDirectory {
    async fn register(&self, conn: &ActiveConnection) -> Result<()> {
        let mut redis = self.conn.clone();
        let session_key = session_key(&conn.session_id);
        let pod_key = pod_key(&conn.pod_id);

        let _: () = redis
            .sadd(&session_key, conn.member())
            .await
            .context("failed to register session membership")?;
        let _: () = redis
            .expire(&session_key, MEMBERSHIP_TTL_SECS)
            .await
            .context("failed to set session membership TTL")?;

        let _: () = redis
            .hset(&pod_key, &conn.connection_id, &conn.session_id)
            .await
            .context("failed to register stream in pod map")?;
        let _: () = redis
            .expire(&pod_key, MEMBERSHIP_TTL_SECS)
            .await
            .context("failed to set pod map TTL")?;

        let _: () = redis
            .set_ex(
                heartbeat_key(&conn.pod_id, &conn.connection_id),
                Utc::now().timestamp().to_string(),
                HEARTBEAT_TTL_SECS,
            )
            .await
            .context("failed to set stream heartbeat")?;

        debug!(
            stream_id = %conn.connection_id,
            session_id = %conn.session_id,
            "registered stream in session directory"
        );
        Ok(())
    }

    async fn deregister(&self, conn: &ActiveConnection) -> Result<()> {
        let mut redis = self.conn.clone();

        let _: () = redis
            .srem(session_key(&conn.session_id), conn.member())
            .await
            .context("failed to remove session membership")?;
        let _: () = redis
            .hdel(pod_key(&conn.pod_id), &conn.connection_id)
            .await
            .context("failed to remove stream from pod map")?;
        let _: () = redis
            .del(heartbeat_key(&conn.pod_id, &conn.connection_id))
            .await
            .context("failed to delete stream heartbeat")?;

        debug!(
            stream_id = %conn.connection_id,
            session_id = %conn.session_id,
            "deregistered stream from session directory"
        );
        Ok(())
    }

    async fn heartbeat(&self, conn: &ActiveConnection) -> Result<()> {
        let mut redis = self.conn.clone();

        let _: () = redis
            .set_ex(
                heartbeat_key(&conn.pod_id, &conn.connection_id),
                Utc::now().timestamp().to_string(),
                HEARTBEAT_TTL_SECS,
            )
            .await
            .context("failed to refresh stream heartbeat")?;
        let _: () = redis
            .expire(session_key(&conn.session_id), MEMBERSHIP_TTL_SECS)
            .await
            .context("failed to renew session membership TTL")?;
        let _: () = redis
            .expire(pod_key(&conn.pod_id), MEMBERSHIP_TTL_SECS)
            .await
            .context("failed to renew pod map TTL")?;

        Ok(())
    }

    async fn active_instances(&self, session_id: &str) -> Result<Vec<String>> {
        let mut redis = self.conn.clone();
        let members: Vec<String> = redis
            .smembers(session_key(session_id))
            .await
            .context("failed to read session membership")?;

        let instances: BTreeSet<String> = members
            .iter()
            .filter_map(|member| instance_of(member))
            .map(str::to_string)
            .collect();

        Ok(instances.into_iter().collect())
    }

    async fn streams_of(&self, pod_id: &str) -> Result<HashMap<String, String>> {
        let mut redis = self.conn.clone();
        let streams: HashMap<String, String> = redis
            .hgetall(pod_key(pod_id))
            .await
            .context("failed to read pod stream map")?;
        Ok(streams)
    }

    async fn cache_session_meta(
        &self,
        session_id: &str,
        meta: &HashMap<String, String>,
    ) -> Result<()> {
        if meta.is_empty() {
            return Ok(());
        }

        let mut redis = self.conn.clone();
        let key = meta_key(session_id);
        let fields: Vec<(&str, &str)> = meta
            .iter()
            .map(|(field, value)| (field.as_str(), value.as_str()))
            .collect();

        let _: () = redis
            .hset_multiple(&key, &fields)
            .await
            .context("failed to cache session metadata")?;
        let _: () = redis
            .expire(&key, SESSION_META_TTL_SECS)
            .await
            .context("failed to set session metadata TTL")?;
        Ok(())
    }

    async fn session_meta(&self, session_id: &str) -> Result<HashMap<String, String>> {
        let mut redis = self.conn.clone();
        let meta: HashMap<String, String> = redis
            .hgetall(meta_key(session_id))
            .await
            .context("failed to read session metadata")?;
        Ok(meta)
    }
}
