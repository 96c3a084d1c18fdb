//! Message bus abstraction
//!
//! The core only needs `publish(topic, envelope)` and
//! `subscribe(topic, consumer_group)`:
//! - `NatsBus` → NATS core pub/sub, consumer groups map to queue groups
//! - `MemoryBus` → in-process delivery with the same group semantics (tests)
//!
//! Configuration via BUS_BACKEND env variable ("nats" or "memory").

use std::collections::HashMap;

use anyhow::Result;
use async_nats::Client;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

use crate::types::MessageEnvelope;

/// Stream of decoded envelopes from one subscription
pub type EnvelopeStream = BoxStream<'static, MessageEnvelope>;

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, envelope: &MessageEnvelope) -> Result<()>;

    /// With a consumer group, each message goes to exactly one member of the
    /// group; without one, every subscriber receives its own copy.
    async fn subscribe(&self, topic: &str, consumer_group: Option<&str>) -> Result<EnvelopeStream>;

    fn name(&self) -> &'static str;
}

// ============================================================================
// NATS
// ============================================================================

pub struct NatsBus {
    client: Client,
}

impl NatsBus {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn publish(&self, topic: &str, envelope: &MessageEnvelope) -> Result<()> {
        let payload = serde_json::to_vec(envelope)?;
        self.client.publish(topic.to_string(), payload.into()).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str, consumer_group: Option<&str>) -> Result<EnvelopeStream> {
        let subscriber = match consumer_group {
            Some(group) => {
                self.client
                    .queue_subscribe(topic.to_string(), group.to_string())
                    .await?
            }
            None => self.client.subscribe(topic.to_string()).await?,
        };

        let topic = topic.to_string();
        let envelopes = subscriber.filter_map(move |msg| {
            let decoded = serde_json::from_slice::<MessageEnvelope>(&msg.payload);
            let result = match decoded {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    warn!("Dropping malformed envelope on {}: {}", topic, e);
                    None
                }
            };
            futures::future::ready(result)
        });

        Ok(envelopes.boxed())
    }

    fn name(&self) -> &'static str {
        "nats"
    }
}

// ============================================================================
// In-memory
// ============================================================================

type Sender = mpsc::UnboundedSender<MessageEnvelope>;

#[derive(Default)]
struct GroupMembers {
    members: Vec<Sender>,
    next: usize,
}

impl GroupMembers {
    /// Round-robin over live members
    fn deliver(&mut self, envelope: &MessageEnvelope) {
        self.members.retain(|m| !m.is_closed());
        if self.members.is_empty() {
            return;
        }
        let idx = self.next % self.members.len();
        self.next = self.next.wrapping_add(1);
        let _ = self.members[idx].send(envelope.clone());
    }
}

#[derive(Default)]
struct TopicSubscribers {
    fanout: Vec<Sender>,
    groups: HashMap<String, GroupMembers>,
}

/// In-process bus
#[derive(Default)]
pub struct MemoryBus {
    topics: Mutex<HashMap<String, TopicSubscribers>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, topic: &str, envelope: &MessageEnvelope) -> Result<()> {
        let mut topics = self.topics.lock();
        if let Some(subs) = topics.get_mut(topic) {
            subs.fanout.retain(|s| s.send(envelope.clone()).is_ok());
            for group in subs.groups.values_mut() {
                group.deliver(envelope);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, consumer_group: Option<&str>) -> Result<EnvelopeStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut topics = self.topics.lock();
            let subs = topics.entry(topic.to_string()).or_default();
            match consumer_group {
                Some(group) => subs
                    .groups
                    .entry(group.to_string())
                    .or_default()
                    .members
                    .push(tx),
                None => subs.fanout.push(tx),
            }
        }

        let envelopes = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|envelope| (envelope, rx))
        });
        Ok(envelopes.boxed())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
