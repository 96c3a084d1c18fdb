//! Cross-service query payloads
//!
//! One concrete struct per query type; envelopes are decoded into these at
//! the handler boundary and never passed around as open maps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::messages::*;
use super::resource::{CandidateFilter, ResourceProjection, ResourceType};

/// The query types answered by this service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    ResourceById,
    ResourcesByIds,
    CandidateResources,
    ResourceAvailability,
}

impl QueryKind {
    pub const ALL: [QueryKind; 4] = [
        QueryKind::ResourceById,
        QueryKind::ResourcesByIds,
        QueryKind::CandidateResources,
        QueryKind::ResourceAvailability,
    ];

    pub fn request_topic(&self) -> &'static str {
        match self {
            QueryKind::ResourceById => TOPIC_RESOURCE_BY_ID,
            QueryKind::ResourcesByIds => TOPIC_RESOURCES_BY_IDS,
            QueryKind::CandidateResources => TOPIC_CANDIDATE_RESOURCES,
            QueryKind::ResourceAvailability => TOPIC_RESOURCE_AVAILABILITY,
        }
    }

    pub fn response_topic(&self) -> String {
        response_topic(self.request_topic())
    }

    pub fn request_event_type(&self) -> &'static str {
        match self {
            QueryKind::ResourceById => EVENT_QUERY_RESOURCE_BY_ID,
            QueryKind::ResourcesByIds => EVENT_QUERY_RESOURCES_BY_IDS,
            QueryKind::CandidateResources => EVENT_QUERY_CANDIDATE_RESOURCES,
            QueryKind::ResourceAvailability => EVENT_CHECK_RESOURCE_AVAILABILITY,
        }
    }

    pub fn response_event_type(&self) -> &'static str {
        match self {
            QueryKind::ResourceById => EVENT_RESOURCE_BY_ID_RESULT,
            QueryKind::ResourcesByIds => EVENT_RESOURCES_BY_IDS_RESULT,
            QueryKind::CandidateResources => EVENT_CANDIDATE_RESOURCES_RESULT,
            QueryKind::ResourceAvailability => EVENT_RESOURCE_AVAILABILITY_RESULT,
        }
    }

    /// Safe-default answer used whenever the real one cannot be built.
    ///
    /// `requested_ids` is only consulted for the batch query, where every
    /// requested id must still be accounted for.
    pub fn fallback(&self, correlation_id: &str, requested_ids: &[String]) -> QueryResponse {
        let correlation_id = correlation_id.to_string();
        match self {
            QueryKind::ResourceById => QueryResponse::ById(ResourceByIdResult {
                correlation_id,
                resource: None,
                found: false,
            }),
            QueryKind::ResourcesByIds => QueryResponse::ByIds(ResourcesByIdsResult {
                correlation_id,
                resources: vec![],
                not_found: dedup_ids(requested_ids),
            }),
            QueryKind::CandidateResources => {
                QueryResponse::Candidates(CandidateResourcesResult {
                    correlation_id,
                    resources: vec![],
                    count: 0,
                })
            }
            QueryKind::ResourceAvailability => {
                QueryResponse::Availability(AvailabilityResult {
                    correlation_id,
                    available: false,
                    conflicts: vec![],
                })
            }
        }
    }
}

/// Removes repeated ids, keeping first occurrences in order
pub fn dedup_ids(ids: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    ids.iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceByIdQuery {
    /// May be absent when only the envelope metadata carries it
    #[serde(default)]
    pub correlation_id: String,
    pub resource_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesByIdsQuery {
    #[serde(default)]
    pub correlation_id: String,
    pub resource_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateResourcesQuery {
    #[serde(default)]
    pub correlation_id: String,
    pub resource_type: ResourceType,
    #[serde(default)]
    pub exclude_id: Option<String>,
    #[serde(default)]
    pub filters: Option<CandidateFilter>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityQuery {
    #[serde(default)]
    pub correlation_id: String,
    pub resource_id: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

/// A decoded, typed query
#[derive(Debug, Clone)]
pub enum QueryRequest {
    ById(ResourceByIdQuery),
    ByIds(ResourcesByIdsQuery),
    Candidates(CandidateResourcesQuery),
    Availability(AvailabilityQuery),
}

impl QueryRequest {
    pub fn decode(kind: QueryKind, envelope: &MessageEnvelope) -> serde_json::Result<Self> {
        Ok(match kind {
            QueryKind::ResourceById => QueryRequest::ById(envelope.decode()?),
            QueryKind::ResourcesByIds => QueryRequest::ByIds(envelope.decode()?),
            QueryKind::CandidateResources => QueryRequest::Candidates(envelope.decode()?),
            QueryKind::ResourceAvailability => QueryRequest::Availability(envelope.decode()?),
        })
    }
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceByIdResult {
    pub correlation_id: String,
    pub resource: Option<ResourceProjection>,
    pub found: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesByIdsResult {
    pub correlation_id: String,
    pub resources: Vec<ResourceProjection>,
    pub not_found: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateResourcesResult {
    pub correlation_id: String,
    pub resources: Vec<ResourceProjection>,
    pub count: usize,
}

/// Why a resource is not available in the requested window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AvailabilityConflict {
    #[serde(rename_all = "camelCase")]
    Maintenance {
        maintenance_id: Uuid,
        title: String,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Status { status: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityResult {
    pub correlation_id: String,
    pub available: bool,
    pub conflicts: Vec<AvailabilityConflict>,
}

/// Answer to one query, ready for publishing
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResponse {
    ById(ResourceByIdResult),
    ByIds(ResourcesByIdsResult),
    Candidates(CandidateResourcesResult),
    Availability(AvailabilityResult),
}

impl QueryResponse {
    pub fn correlation_id(&self) -> &str {
        match self {
            QueryResponse::ById(r) => &r.correlation_id,
            QueryResponse::ByIds(r) => &r.correlation_id,
            QueryResponse::Candidates(r) => &r.correlation_id,
            QueryResponse::Availability(r) => &r.correlation_id,
        }
    }

    pub fn to_value(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            QueryResponse::ById(r) => serde_json::to_value(r),
            QueryResponse::ByIds(r) => serde_json::to_value(r),
            QueryResponse::Candidates(r) => serde_json::to_value(r),
            QueryResponse::Availability(r) => serde_json::to_value(r),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(data: serde_json::Value) -> MessageEnvelope {
        MessageEnvelope::new("X", "test", &data).unwrap()
    }

    #[test]
    fn test_decode_candidate_query_with_filters() {
        let env = envelope(json!({
            "correlationId": "c1",
            "resourceType": "CLASSROOM",
            "excludeId": "abc",
            "filters": {"capacity": 20, "features": ["projector"]},
            "limit": 3
        }));
        let req = QueryRequest::decode(QueryKind::CandidateResources, &env).unwrap();
        match req {
            QueryRequest::Candidates(q) => {
                assert_eq!(q.resource_type, ResourceType::Classroom);
                assert_eq!(q.limit, Some(3));
                let filters = q.filters.unwrap();
                assert_eq!(filters.capacity, Some(20));
                assert_eq!(filters.features, vec!["projector".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_unknown_resource_type() {
        let env = envelope(json!({
            "correlationId": "c1",
            "resourceType": "SPACESHIP",
            "excludeId": "abc"
        }));
        assert!(QueryRequest::decode(QueryKind::CandidateResources, &env).is_err());
    }

    #[test]
    fn test_fallbacks_are_fail_closed() {
        let by_id = QueryKind::ResourceById.fallback("c", &[]).to_value().unwrap();
        assert_eq!(by_id["found"], json!(false));
        assert_eq!(by_id["resource"], json!(null));

        let avail = QueryKind::ResourceAvailability.fallback("c", &[]).to_value().unwrap();
        assert_eq!(avail["available"], json!(false));

        let cands = QueryKind::CandidateResources.fallback("c", &[]).to_value().unwrap();
        assert_eq!(cands["count"], json!(0));
    }

    #[test]
    fn test_batch_fallback_accounts_for_every_id_once() {
        let ids = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        let resp = QueryKind::ResourcesByIds.fallback("c", &ids);
        match resp {
            QueryResponse::ByIds(r) => assert_eq!(r.not_found, vec!["a", "b"]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_availability_conflict_tagging() {
        let conflict = AvailabilityConflict::Status { status: "MAINTENANCE".into() };
        let json = serde_json::to_value(&conflict).unwrap();
        assert_eq!(json, json!({"type": "STATUS", "status": "MAINTENANCE"}));
    }
}
