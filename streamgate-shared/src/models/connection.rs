use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cluster-visible registration record for one subscriber stream.
///
/// Written to the session directory so that producer tiers can route
/// fragments to the instance that owns the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveConnection {
    pub connection_id: String,
    pub session_id: String,
    pub pod_id: String,
    pub user_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl ActiveConnection {
    /// Membership marker stored in the per-session directory set.
    pub fn member(&self) -> String {
        format!("{}:{}", self.pod_id, self.connection_id)
    }
}
