//! Cross-service query responders
//!
//! Every request that carries a correlation id gets exactly one response on
//! the paired response topic. Faults never escape: they are logged and
//! replaced by the query type's fail-closed answer. Requests without a
//! correlation id cannot be answered and are dropped.

use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use thiserror::Error;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::defaults::CANDIDATE_MAX_LIMIT;
use crate::services::bus::{EnvelopeStream, MessageBus};
use crate::services::store::ResourceStore;
use crate::types::{
    AvailabilityConflict, AvailabilityQuery, AvailabilityResult, CandidateResourcesQuery,
    CandidateResourcesResult, MessageEnvelope, QueryKind, QueryRequest, QueryResponse,
    ResourceByIdQuery, ResourceByIdResult, ResourceProjection, ResourceStatus,
    ResourcesByIdsQuery, ResourcesByIdsResult, dedup_ids,
};

/// Anything that kept a responder from building its real answer
#[derive(Debug, Error)]
pub enum QueryFault {
    #[error("Malformed request: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Repository failure: {0}")]
    Store(#[from] anyhow::Error),
}

/// Read-only answers to the four query types
pub struct QueryResponder {
    resources: Arc<dyn ResourceStore>,
    default_limit: usize,
}

impl QueryResponder {
    pub fn new(resources: Arc<dyn ResourceStore>, default_limit: usize) -> Self {
        Self {
            resources,
            default_limit,
        }
    }

    /// The response to publish, or `None` when there is nobody to answer
    pub async fn answer(&self, kind: QueryKind, envelope: &MessageEnvelope) -> Option<QueryResponse> {
        let Some(correlation_id) = envelope.correlation_id() else {
            warn!(
                "{} from {} without correlation id dropped",
                envelope.event_type, envelope.service
            );
            return None;
        };

        match self.try_answer(kind, correlation_id, envelope).await {
            Ok(response) => Some(response),
            Err(fault) => {
                warn!(
                    "{} ({}) answered with safe default: {}",
                    kind.request_event_type(),
                    correlation_id,
                    fault
                );
                Some(kind.fallback(correlation_id, &requested_ids(envelope)))
            }
        }
    }

    async fn try_answer(
        &self,
        kind: QueryKind,
        correlation_id: &str,
        envelope: &MessageEnvelope,
    ) -> Result<QueryResponse, QueryFault> {
        let correlation_id = correlation_id.to_string();
        let response = match QueryRequest::decode(kind, envelope)? {
            QueryRequest::ById(q) => QueryResponse::ById(self.resource_by_id(correlation_id, q).await?),
            QueryRequest::ByIds(q) => {
                QueryResponse::ByIds(self.resources_by_ids(correlation_id, q).await?)
            }
            QueryRequest::Candidates(q) => {
                QueryResponse::Candidates(self.candidate_resources(correlation_id, q).await?)
            }
            QueryRequest::Availability(q) => {
                QueryResponse::Availability(self.availability(correlation_id, q).await?)
            }
        };
        Ok(response)
    }

    pub async fn resource_by_id(
        &self,
        correlation_id: String,
        query: ResourceByIdQuery,
    ) -> Result<ResourceByIdResult, QueryFault> {
        let resource = match Uuid::parse_str(query.resource_id.trim()) {
            Ok(id) => self.resources.find_resource(id).await?,
            Err(_) => None,
        };

        Ok(ResourceByIdResult {
            correlation_id,
            found: resource.is_some(),
            resource: resource.as_ref().map(ResourceProjection::from),
        })
    }

    /// Every distinct requested id ends up in exactly one of the two lists
    pub async fn resources_by_ids(
        &self,
        correlation_id: String,
        query: ResourcesByIdsQuery,
    ) -> Result<ResourcesByIdsResult, QueryFault> {
        let mut resources = Vec::new();
        let mut not_found = Vec::new();

        // Ids resolve independently; a failed lookup only costs that id
        for raw_id in dedup_ids(&query.resource_ids) {
            let resource = match Uuid::parse_str(raw_id.trim()) {
                Ok(id) => match self.resources.find_resource(id).await {
                    Ok(found) => found,
                    Err(e) => {
                        warn!("Lookup of {} in batch {} failed: {}", raw_id, correlation_id, e);
                        None
                    }
                },
                Err(_) => None,
            };
            match resource {
                Some(r) => resources.push(ResourceProjection::from(&r)),
                None => not_found.push(raw_id),
            }
        }

        Ok(ResourcesByIdsResult {
            correlation_id,
            resources,
            not_found,
        })
    }

    pub async fn candidate_resources(
        &self,
        correlation_id: String,
        query: CandidateResourcesQuery,
    ) -> Result<CandidateResourcesResult, QueryFault> {
        let mut filter = query.filters.unwrap_or_default();
        filter.resource_type = Some(query.resource_type);
        // An unparseable id cannot match any stored resource
        filter.exclude_id = query
            .exclude_id
            .as_deref()
            .and_then(|id| Uuid::parse_str(id.trim()).ok());

        let limit = query
            .limit
            .filter(|l| *l > 0)
            .unwrap_or(self.default_limit)
            .min(CANDIDATE_MAX_LIMIT);

        let resources: Vec<ResourceProjection> = self
            .resources
            .find_candidates(&filter, limit)
            .await?
            .iter()
            .map(ResourceProjection::from)
            .collect();

        Ok(CandidateResourcesResult {
            correlation_id,
            count: resources.len(),
            resources,
        })
    }

    /// Available only when the resource exists, is in service and has no
    /// blocking maintenance overlapping `[startDate, endDate)`
    pub async fn availability(
        &self,
        correlation_id: String,
        query: AvailabilityQuery,
    ) -> Result<AvailabilityResult, QueryFault> {
        let unavailable = |conflicts| AvailabilityResult {
            correlation_id: correlation_id.clone(),
            available: false,
            conflicts,
        };

        if query.start_date >= query.end_date {
            debug!("Empty availability window for {}", query.resource_id);
            return Ok(unavailable(vec![]));
        }
        let Ok(resource_id) = Uuid::parse_str(query.resource_id.trim()) else {
            return Ok(unavailable(vec![]));
        };
        let Some(resource) = self.resources.find_resource(resource_id).await? else {
            return Ok(unavailable(vec![]));
        };

        let mut conflicts = Vec::new();
        if matches!(
            resource.status,
            ResourceStatus::Maintenance | ResourceStatus::OutOfService
        ) {
            conflicts.push(AvailabilityConflict::Status {
                status: resource.status.as_str().to_string(),
            });
        }

        let maintenance = self
            .resources
            .find_blocking_maintenance(resource_id, query.start_date, query.end_date)
            .await?;
        conflicts.extend(maintenance.into_iter().map(|m| AvailabilityConflict::Maintenance {
            maintenance_id: m.id,
            title: m.title,
            starts_at: m.starts_at,
            ends_at: m.ends_at,
        }));

        Ok(AvailabilityResult {
            correlation_id,
            available: conflicts.is_empty(),
            conflicts,
        })
    }
}

/// Ids named by a batch request, read leniently so a fallback can list them
fn requested_ids(envelope: &MessageEnvelope) -> Vec<String> {
    envelope
        .data
        .get("resourceIds")
        .and_then(|v| v.as_array())
        .map(|ids| {
            ids.iter()
                .map(|v| match v.as_str() {
                    Some(id) => id.to_string(),
                    None => v.to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Publish one response on the query type's response topic
pub async fn publish_response(
    bus: &dyn MessageBus,
    service_name: &str,
    kind: QueryKind,
    response: &QueryResponse,
) -> Result<()> {
    let envelope = MessageEnvelope::new(kind.response_event_type(), service_name, &response.to_value()?)?;
    bus.publish(&kind.response_topic(), &envelope).await
}

/// Serve one query topic until shutdown. Each request runs in its own task.
pub async fn handle_queries(
    bus: Arc<dyn MessageBus>,
    service_name: Arc<str>,
    kind: QueryKind,
    mut requests: EnvelopeStream,
    responder: Arc<QueryResponder>,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let envelope = select! {
            _ = shutdown.cancelled() => break,
            next = requests.next() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };
        debug!("Received {} on {}", envelope.event_type, kind.request_topic());

        let bus = bus.clone();
        let service_name = service_name.clone();
        let responder = responder.clone();
        tokio::spawn(async move {
            let Some(response) = responder.answer(kind, &envelope).await else {
                return;
            };
            if let Err(e) = publish_response(bus.as_ref(), &service_name, kind, &response).await {
                error!(
                    "Failed to publish {} for {}: {}",
                    kind.response_event_type(),
                    response.correlation_id(),
                    e
                );
            }
        });
    }

    Ok(())
}
