use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Classification of a response fragment.
///
/// Only `content` fragments contribute to the assembled reply text; the
/// other variants ride along as metadata on the finalized message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    Content,
    Metadata,
    Error,
    System,
}

/// Structured error carried by a fragment when the generator failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

/// One fragment of a streamed reply as published by the workflow tier.
///
/// `chunk_id` is the per-message sequence number. Exactly one fragment per
/// message carries `is_final = true`; its sequence is the largest produced
/// and the range `[0, final]` has no gaps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseChunk {
    pub session_id: String,
    pub message_id: String,
    pub chunk_id: u64,
    pub chunk: String,
    pub chunk_type: ChunkType,
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
}
