//! Requester side of the cross-service queries
//!
//! Publishes a query and waits for the response carrying the same correlation
//! id. Each attempt waits `timeout`; a silent attempt is re-published with the
//! same correlation id until `max_attempts` is used up. The first response
//! wins and later duplicates are dropped.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::services::bus::MessageBus;
use crate::types::{
    AvailabilityQuery, AvailabilityResult, CandidateFilter, CandidateResourcesQuery,
    CandidateResourcesResult, MessageEnvelope, QueryKind, ResourceByIdQuery, ResourceByIdResult,
    ResourceProjection, ResourceType, ResourcesByIdsQuery, ResourcesByIdsResult,
};

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("No response on {topic} after {attempts} attempt(s)")]
    Timeout { topic: String, attempts: u32 },
    #[error(transparent)]
    Bus(#[from] anyhow::Error),
    #[error("Malformed query payload: {0}")]
    Decode(#[from] serde_json::Error),
}

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<MessageEnvelope>>>>;

pub struct QueryClient {
    bus: Arc<dyn MessageBus>,
    service_name: String,
    timeout: Duration,
    max_attempts: u32,
    pending: Pending,
    shutdown: CancellationToken,
}

impl QueryClient {
    /// Subscribe to every response topic and start routing responses
    pub async fn connect(
        bus: Arc<dyn MessageBus>,
        service_name: impl Into<String>,
        timeout: Duration,
        max_attempts: u32,
    ) -> anyhow::Result<Self> {
        let pending: Pending = Arc::default();
        let shutdown = CancellationToken::new();

        for kind in QueryKind::ALL {
            let topic = kind.response_topic();
            // Ungrouped: every requester instance must see every response
            let mut responses = bus.subscribe(&topic, None).await?;
            let pending = pending.clone();
            let token = shutdown.clone();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        next = responses.next() => match next {
                            Some(envelope) => route_response(&pending, &topic, envelope),
                            None => break,
                        },
                    }
                }
            });
        }

        Ok(Self {
            bus,
            service_name: service_name.into(),
            timeout,
            max_attempts: max_attempts.max(1),
            pending,
            shutdown,
        })
    }

    pub async fn resource_by_id(&self, resource_id: &str) -> Result<ResourceByIdResult, QueryError> {
        let correlation_id = Uuid::new_v4().to_string();
        let query = ResourceByIdQuery {
            correlation_id: correlation_id.clone(),
            resource_id: resource_id.to_string(),
        };
        self.request(QueryKind::ResourceById, &correlation_id, &query).await
    }

    pub async fn resources_by_ids(&self, resource_ids: Vec<String>) -> Result<ResourcesByIdsResult, QueryError> {
        let correlation_id = Uuid::new_v4().to_string();
        let query = ResourcesByIdsQuery {
            correlation_id: correlation_id.clone(),
            resource_ids,
        };
        self.request(QueryKind::ResourcesByIds, &correlation_id, &query).await
    }

    pub async fn candidate_resources(
        &self,
        resource_type: ResourceType,
        exclude_id: Option<String>,
        filters: Option<CandidateFilter>,
        limit: Option<usize>,
    ) -> Result<CandidateResourcesResult, QueryError> {
        let correlation_id = Uuid::new_v4().to_string();
        let query = CandidateResourcesQuery {
            correlation_id: correlation_id.clone(),
            resource_type,
            exclude_id,
            filters,
            limit,
        };
        self.request(QueryKind::CandidateResources, &correlation_id, &query).await
    }

    pub async fn check_availability(
        &self,
        resource_id: &str,
        start_date: DateTime<Utc>,
        end_date: DateTime<Utc>,
    ) -> Result<AvailabilityResult, QueryError> {
        let correlation_id = Uuid::new_v4().to_string();
        let query = AvailabilityQuery {
            correlation_id: correlation_id.clone(),
            resource_id: resource_id.to_string(),
            start_date,
            end_date,
        };
        self.request(QueryKind::ResourceAvailability, &correlation_id, &query).await
    }

    /// `false` unless the responder positively confirmed availability
    pub async fn is_available(&self, resource_id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        match self.check_availability(resource_id, start, end).await {
            Ok(result) => result.available,
            Err(e) => {
                warn!("Availability of {} unknown, treating as unavailable: {}", resource_id, e);
                false
            }
        }
    }

    /// `None` when the resource is missing or the query failed
    pub async fn find_resource(&self, resource_id: &str) -> Option<ResourceProjection> {
        match self.resource_by_id(resource_id).await {
            Ok(result) => result.resource.filter(|_| result.found),
            Err(e) => {
                warn!("Lookup of resource {} failed: {}", resource_id, e);
                None
            }
        }
    }

    async fn request<Q, R>(&self, kind: QueryKind, correlation_id: &str, query: &Q) -> Result<R, QueryError>
    where
        Q: Serialize,
        R: DeserializeOwned,
    {
        let envelope = MessageEnvelope::new(kind.request_event_type(), &self.service_name, query)?;
        let topic = kind.request_topic();
        let _waiting = PendingGuard {
            pending: &self.pending,
            correlation_id,
        };

        for attempt in 1..=self.max_attempts {
            let (tx, rx) = oneshot::channel();
            self.pending.lock().insert(correlation_id.to_string(), tx);

            self.bus.publish(topic, &envelope).await?;

            match tokio::time::timeout(self.timeout, rx).await {
                Ok(Ok(response)) => return Ok(response.decode()?),
                Ok(Err(_)) | Err(_) => {
                    debug!(
                        "No response on {} for {} (attempt {}/{})",
                        topic, correlation_id, attempt, self.max_attempts
                    );
                }
            }
        }

        Err(QueryError::Timeout {
            topic: topic.to_string(),
            attempts: self.max_attempts,
        })
    }
}

impl Drop for QueryClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Clears the pending entry however the request ends, including when the
/// caller drops the future mid-wait
struct PendingGuard<'a> {
    pending: &'a Pending,
    correlation_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(self.correlation_id);
    }
}

fn route_response(pending: &Pending, topic: &str, envelope: MessageEnvelope) {
    let Some(correlation_id) = envelope.correlation_id().map(str::to_string) else {
        debug!("Response on {} without correlation id dropped", topic);
        return;
    };
    let waiter = pending.lock().remove(&correlation_id);
    match waiter {
        Some(tx) => {
            let _ = tx.send(envelope);
        }
        None => debug!(
            "Response on {} for unknown or answered correlation id {} dropped",
            topic, correlation_id
        ),
    }
}
