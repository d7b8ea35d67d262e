use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A fully assembled reply, produced exactly once per message when the
/// terminal fragment has been received and the sequence range is dense.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub session_id: String,
    pub role: String,
    pub content: String,
    pub token_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
    pub created_at: DateTime<Utc>,
}

/// Observability snapshot of one reorder buffer.
///
/// `total_expected` is only known once the terminal fragment has been seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_expected: Option<u64>,
    pub total_received: u64,
    pub total_sent: u64,
    pub missing_chunks: Vec<u64>,
    pub is_complete: bool,
}
