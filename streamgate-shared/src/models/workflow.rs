use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope published to `chat.workflow.execute.<session_id>` when a
/// submission is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRequest {
    pub message_id: String,
    pub session_id: String,
    pub user_id: String,
    pub message: String,
    #[serde(default)]
    pub context: HashMap<String, Value>,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
}
