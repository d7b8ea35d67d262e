use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of `POST /api/chat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub session_id: String,
    pub user_id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<HashMap<String, Value>>,
}

/// Accepted-submission acknowledgement returned with `202`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub message_id: String,
    pub session_id: String,
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_requires_mandatory_fields() {
        let err = serde_json::from_value::<ChatRequest>(json!({
            "session_id": "s-1",
            "message": "hi"
        }));
        assert!(err.is_err());
    }

    #[test]
    fn request_accepts_optional_provider_settings() {
        let request: ChatRequest = serde_json::from_value(json!({
            "session_id": "s-1",
            "user_id": "u-1",
            "message": "hi",
            "ai_provider": "openai",
            "model": "gpt-4o",
            "context": {"temperature": 0.2}
        }))
        .unwrap();

        assert_eq!(request.ai_provider.as_deref(), Some("openai"));
        assert_eq!(
            request.context.unwrap().get("temperature"),
            Some(&json!(0.2))
        );
    }

    #[test]
    fn response_serializes_wire_fields() {
        let response = ChatResponse {
            message_id: "m-1".into(),
            session_id: "s-1".into(),
            status: "accepted".into(),
            timestamp: Utc::now(),
            correlation_id: "c-1".into(),
        };

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["status"], json!("accepted"));
        assert!(value["timestamp"].is_string());
    }
}
