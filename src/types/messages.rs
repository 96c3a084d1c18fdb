//! Bus message types

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Request topics and their paired response topics
pub const TOPIC_RESOURCE_BY_ID: &str = "resources.query.by_id";
pub const TOPIC_RESOURCES_BY_IDS: &str = "resources.query.by_ids";
pub const TOPIC_CANDIDATE_RESOURCES: &str = "resources.query.candidates";
pub const TOPIC_RESOURCE_AVAILABILITY: &str = "resources.query.availability";

pub const TOPIC_IMPORT_SUBMIT: &str = "resources.import.submit";
pub const TOPIC_IMPORT_GET: &str = "resources.import.get";
pub const TOPIC_IMPORT_ROLLBACK: &str = "resources.import.rollback";
pub const TOPIC_IMPORT_VALIDATE: &str = "resources.import.validate";
pub const TOPIC_IMPORT_RUN: &str = "resources.import.run";

/// Topic on which answers to `request_topic` are published
pub fn response_topic(request_topic: &str) -> String {
    format!("{}.response", request_topic)
}

// Envelope event types
pub const EVENT_QUERY_RESOURCE_BY_ID: &str = "QUERY_RESOURCE_BY_ID";
pub const EVENT_QUERY_RESOURCES_BY_IDS: &str = "QUERY_RESOURCES_BY_IDS";
pub const EVENT_QUERY_CANDIDATE_RESOURCES: &str = "QUERY_CANDIDATE_RESOURCES";
pub const EVENT_CHECK_RESOURCE_AVAILABILITY: &str = "CHECK_RESOURCE_AVAILABILITY";
pub const EVENT_RESOURCE_BY_ID_RESULT: &str = "RESOURCE_BY_ID_RESULT";
pub const EVENT_RESOURCES_BY_IDS_RESULT: &str = "RESOURCES_BY_IDS_RESULT";
pub const EVENT_CANDIDATE_RESOURCES_RESULT: &str = "CANDIDATE_RESOURCES_RESULT";
pub const EVENT_RESOURCE_AVAILABILITY_RESULT: &str = "RESOURCE_AVAILABILITY_RESULT";
pub const EVENT_IMPORT_COMMAND: &str = "IMPORT_COMMAND";
pub const EVENT_IMPORT_COMMAND_RESULT: &str = "IMPORT_COMMAND_RESULT";

/// Optional envelope metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Wire format of every message on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub event_id: Uuid,
    pub event_type: String,
    pub service: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EnvelopeMetadata>,
}

impl MessageEnvelope {
    /// Build an envelope with a fresh event id. The correlation id, if the
    /// payload carries one, is mirrored into the metadata.
    pub fn new<T: Serialize>(
        event_type: impl Into<String>,
        service: impl Into<String>,
        payload: &T,
    ) -> serde_json::Result<Self> {
        let data = serde_json::to_value(payload)?;
        let metadata = data
            .get("correlationId")
            .and_then(|v| v.as_str())
            .map(|c| EnvelopeMetadata {
                correlation_id: Some(c.to_string()),
                ..Default::default()
            });

        Ok(Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            service: service.into(),
            timestamp: Utc::now(),
            data,
            metadata,
        })
    }

    /// Correlation id from `data`, falling back to `metadata`
    pub fn correlation_id(&self) -> Option<&str> {
        self.data
            .get("correlationId")
            .and_then(|v| v.as_str())
            .or_else(|| {
                self.metadata
                    .as_ref()
                    .and_then(|m| m.correlation_id.as_deref())
            })
    }

    /// Decode `data` into a concrete payload type
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.data.clone())
    }
}

/// Error body of a failed command response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

/// Response to an import command published on the paired response topic
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub correlation_id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

impl CommandResponse {
    pub fn success(correlation_id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(
        correlation_id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            ok: false,
            result: None,
            error: Some(ErrorDetail {
                code: code.into(),
                message: message.into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_serializes_camel_case() {
        let env = MessageEnvelope::new(
            EVENT_QUERY_RESOURCE_BY_ID,
            "reservations-service",
            &json!({"resourceId": "abc", "correlationId": "c-1"}),
        )
        .unwrap();
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("eventId"));
        assert!(json.contains("eventType"));
        assert!(json.contains("\"service\":\"reservations-service\""));
    }

    #[test]
    fn test_envelope_mirrors_correlation_id_into_metadata() {
        let env = MessageEnvelope::new("X", "svc", &json!({"correlationId": "c-42"})).unwrap();
        assert_eq!(
            env.metadata.as_ref().and_then(|m| m.correlation_id.as_deref()),
            Some("c-42")
        );
        assert_eq!(env.correlation_id(), Some("c-42"));
    }

    #[test]
    fn test_correlation_id_falls_back_to_metadata() {
        let raw = json!({
            "eventId": Uuid::new_v4(),
            "eventType": "QUERY_RESOURCE_BY_ID",
            "service": "availability-service",
            "timestamp": "2026-01-05T10:00:00Z",
            "data": {"resourceId": "r1"},
            "metadata": {"correlationId": "meta-7", "traceId": "t"}
        });
        let env: MessageEnvelope = serde_json::from_value(raw).unwrap();
        assert_eq!(env.correlation_id(), Some("meta-7"));
        let meta = env.metadata.unwrap();
        assert_eq!(meta.extra.get("traceId"), Some(&json!("t")));
    }

    #[test]
    fn test_envelope_without_correlation_id_has_no_metadata() {
        let env = MessageEnvelope::new("X", "svc", &json!({"a": 1})).unwrap();
        assert!(env.metadata.is_none());
        assert!(env.correlation_id().is_none());
    }

    #[test]
    fn test_response_topic_is_paired() {
        assert_eq!(response_topic(TOPIC_RESOURCE_BY_ID), "resources.query.by_id.response");
    }

    #[test]
    fn test_command_response_failure_shape() {
        let resp = CommandResponse::failure("c", "NOT_FOUND", "missing");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["ok"], json!(false));
        assert_eq!(json["error"]["code"], json!("NOT_FOUND"));
        assert!(json.get("result").is_none());
    }
}
