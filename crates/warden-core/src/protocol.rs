//! Wire protocol for the monitor: line-delimited JSON.
//!
//! One request line in, one reply line out, over a persistent
//! connection. Both the monitor and the client guard use these types,
//! so the two enforcement points cannot drift apart on the wire shape.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::dispatch::Decision;
use crate::engine::Detection;

/// A turn submitted for analysis.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyzeRequest {
    /// Session the turn belongs to; omitted on first contact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// What the user sent.
    #[serde(default)]
    pub user_message: String,
    /// What the model replied.
    #[serde(default)]
    pub model_response: String,
    /// Client-side send time, seconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

impl AnalyzeRequest {
    /// Builds a request stamped with the current time.
    pub fn new(
        conversation_id: impl Into<String>,
        user_message: impl Into<String>,
        model_response: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: Some(conversation_id.into()),
            user_message: user_message.into(),
            model_response: model_response.into(),
            timestamp: Some(epoch_seconds()),
        }
    }
}

/// Reply metadata block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyMetadata {
    /// When the analysis ran (RFC 3339).
    pub analyzed_at: String,
    /// Number of detections in the reply.
    pub detection_count: usize,
}

/// A successful analysis reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeReply {
    /// Session the turn was recorded under.
    pub conversation_id: String,
    /// Server-side reply time, seconds since the epoch.
    pub timestamp: f64,
    /// Detections the turn produced.
    pub detections: Vec<Detection>,
    /// The dispatcher's verdict for the turn.
    pub decision: Decision,
    /// Metadata block.
    pub metadata: ReplyMetadata,
}

impl AnalyzeReply {
    /// Builds a reply stamped with the current time.
    pub fn new(
        conversation_id: impl Into<String>,
        detections: Vec<Detection>,
        decision: Decision,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            timestamp: epoch_seconds(),
            metadata: ReplyMetadata {
                analyzed_at: Utc::now().to_rfc3339(),
                detection_count: detections.len(),
            },
            detections,
            decision,
        }
    }
}

/// An error reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReply {
    /// Human-readable error description.
    pub error: String,
}

impl ErrorReply {
    /// The reply sent for a line that is not valid JSON.
    pub fn invalid_json() -> Self {
        Self {
            error: "Invalid JSON format".to_string(),
        }
    }

    /// The reply sent when processing a valid request fails.
    pub fn server_error(description: impl std::fmt::Display) -> Self {
        Self {
            error: format!("Server error: {description}"),
        }
    }
}

/// Seconds since the Unix epoch, with millisecond precision.
pub fn epoch_seconds() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_deserializes_with_minimal_fields() {
        let request: AnalyzeRequest =
            serde_json::from_str(r#"{"user_message": "hi", "model_response": "hello"}"#).unwrap();
        assert!(request.conversation_id.is_none());
        assert!(request.timestamp.is_none());
        assert_eq!(request.user_message, "hi");
    }

    #[test]
    fn reply_serializes_wire_fields() {
        let reply = AnalyzeReply::new("conv-1", Vec::new(), Decision::allow());
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&reply).unwrap()).unwrap();

        assert_eq!(value["conversation_id"], "conv-1");
        assert!(value["timestamp"].is_f64() || value["timestamp"].is_u64());
        assert!(value["detections"].as_array().unwrap().is_empty());
        assert_eq!(value["metadata"]["detection_count"], 0);
        assert!(value["metadata"]["analyzed_at"].is_string());
    }

    #[test]
    fn error_replies_use_fixed_shapes() {
        let invalid = serde_json::to_value(ErrorReply::invalid_json()).unwrap();
        assert_eq!(invalid["error"], "Invalid JSON format");

        let internal = serde_json::to_value(ErrorReply::server_error("boom")).unwrap();
        assert_eq!(internal["error"], "Server error: boom");
    }
}
