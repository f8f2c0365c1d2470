use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use alertcast_sdk::objects::Attributes;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use super::Topic;
use super::backbone::{Acker, Backbone, BusError, Delivery, DeliveryStream, MessageId, Provisioned};

/// In-process backbone.
///
/// Topics and subscriptions must be provisioned before use, like on a real
/// broker. A nacked delivery is queued again with its attempt counter
/// bumped; once `max_deliver` attempts were made it is dropped and counted
/// as dead-lettered.
pub struct MemoryBackbone {
    state: Mutex<State>,
    max_deliver: Option<u32>,
}

#[derive(Default)]
struct State {
    topics: HashSet<Topic>,
    subscriptions: HashMap<Topic, Queue>,
    next_id: u64,
}

struct Queue {
    tx: mpsc::UnboundedSender<Pending>,
    /// Taken by the first `pull`.
    rx: Option<mpsc::UnboundedReceiver<Pending>>,
    counters: Arc<Counters>,
}

#[derive(Clone)]
struct Pending {
    id: MessageId,
    data: Bytes,
    attributes: Attributes,
    attempt: u32,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    acked: AtomicU64,
    nacked: AtomicU64,
    redelivered: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Per-subscription counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub published: u64,
    pub acked: u64,
    pub nacked: u64,
    pub redelivered: u64,
    pub dead_lettered: u64,
}

impl MemoryBackbone {
    /// Unlimited redelivery.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            max_deliver: None,
        }
    }

    /// Stop redelivering after `max_deliver` attempts. Zero means unlimited.
    pub fn with_max_deliver(mut self, max_deliver: u32) -> Self {
        self.max_deliver = (max_deliver > 0).then_some(max_deliver);
        self
    }

    pub fn stats(&self, topic: Topic) -> Option<SubscriptionStats> {
        let state = self.lock();
        let c = &state.subscriptions.get(&topic)?.counters;
        Some(SubscriptionStats {
            published: c.published.load(Ordering::Relaxed),
            acked: c.acked.load(Ordering::Relaxed),
            nacked: c.nacked.load(Ordering::Relaxed),
            redelivered: c.redelivered.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryBackbone {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backbone for MemoryBackbone {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn ensure_topic(&self, topic: Topic) -> Result<Provisioned, BusError> {
        Ok(if self.lock().topics.insert(topic) {
            Provisioned::Created
        } else {
            Provisioned::AlreadyExists
        })
    }

    async fn ensure_subscription(&self, topic: Topic) -> Result<Provisioned, BusError> {
        let mut state = self.lock();
        if !state.topics.contains(&topic) {
            return Err(BusError::Backbone(format!("topic {topic} does not exist")));
        }
        if state.subscriptions.contains_key(&topic) {
            return Ok(Provisioned::AlreadyExists);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscriptions.insert(
            topic,
            Queue {
                tx,
                rx: Some(rx),
                counters: Arc::default(),
            },
        );
        Ok(Provisioned::Created)
    }

    async fn publish(
        &self,
        topic: Topic,
        data: Bytes,
        attributes: &Attributes,
    ) -> Result<MessageId, BusError> {
        let mut state = self.lock();
        if !state.topics.contains(&topic) {
            return Err(BusError::Backbone(format!("topic {topic} does not exist")));
        }
        state.next_id += 1;
        let id = format!("{topic}:{}", state.next_id);

        match state.subscriptions.get(&topic) {
            Some(queue) => {
                let pending = Pending {
                    id: id.clone(),
                    data,
                    attributes: attributes.clone(),
                    attempt: 1,
                };
                if queue.tx.send(pending).is_ok() {
                    queue.counters.published.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => debug!(%topic, "Topic has no subscription, message dropped"),
        }
        Ok(id)
    }

    async fn pull(&self, topic: Topic) -> Result<DeliveryStream, BusError> {
        let mut state = self.lock();
        let queue = state
            .subscriptions
            .get_mut(&topic)
            .ok_or_else(|| BusError::UnknownSubscription(topic.subscription().to_owned()))?;
        let rx = queue.rx.take().ok_or_else(|| {
            BusError::Backbone(format!("{} already has a consumer", topic.subscription()))
        })?;

        let requeue = queue.tx.clone();
        let counters = Arc::clone(&queue.counters);
        let max_deliver = self.max_deliver;

        let stream = UnboundedReceiverStream::new(rx).map(move |pending: Pending| {
            let acker = MemoryAcker {
                message: pending.clone(),
                requeue: requeue.clone(),
                counters: Arc::clone(&counters),
                max_deliver,
            };
            Ok(Delivery::new(
                pending.id,
                pending.data,
                pending.attributes,
                pending.attempt,
                Box::new(acker),
            ))
        });
        Ok(stream.boxed())
    }
}

struct MemoryAcker {
    message: Pending,
    requeue: mpsc::UnboundedSender<Pending>,
    counters: Arc<Counters>,
    max_deliver: Option<u32>,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(self: Box<Self>) -> Result<(), BusError> {
        self.counters.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn nack(self: Box<Self>) -> Result<(), BusError> {
        self.counters.nacked.fetch_add(1, Ordering::Relaxed);

        let mut message = self.message;
        if self.max_deliver.is_some_and(|max| message.attempt >= max) {
            warn!(message_id = %message.id, attempts = message.attempt, "Delivery attempts exhausted, dropping message");
            self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        message.attempt += 1;
        self.requeue
            .send(message)
            .map_err(|_| BusError::Backbone("subscription closed".to_owned()))?;
        self.counters.redelivered.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::backbone::Disposition;

    async fn provisioned(backbone: &MemoryBackbone) {
        backbone.ensure_topic(Topic::EmergencyAlerts).await.unwrap();
        backbone.ensure_subscription(Topic::EmergencyAlerts).await.unwrap();
    }

    #[tokio::test]
    async fn test_provisioning_is_idempotent() {
        let backbone = MemoryBackbone::new();
        assert_eq!(backbone.ensure_topic(Topic::DisasterWarnings).await.unwrap(), Provisioned::Created);
        assert_eq!(
            backbone.ensure_topic(Topic::DisasterWarnings).await.unwrap(),
            Provisioned::AlreadyExists
        );
        assert_eq!(
            backbone.ensure_subscription(Topic::DisasterWarnings).await.unwrap(),
            Provisioned::Created
        );
        assert_eq!(
            backbone.ensure_subscription(Topic::DisasterWarnings).await.unwrap(),
            Provisioned::AlreadyExists
        );
    }

    #[tokio::test]
    async fn test_subscription_requires_topic() {
        let backbone = MemoryBackbone::new();
        assert!(backbone.ensure_subscription(Topic::EvacuationNotices).await.is_err());
        assert!(
            backbone
                .publish(Topic::EvacuationNotices, Bytes::from_static(b"{}"), &Attributes::new())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_nack_redelivers_with_next_attempt() {
        let backbone = MemoryBackbone::new().with_max_deliver(2);
        provisioned(&backbone).await;
        let mut stream = backbone.pull(Topic::EmergencyAlerts).await.unwrap();

        backbone
            .publish(Topic::EmergencyAlerts, Bytes::from_static(b"{}"), &Attributes::new())
            .await
            .unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.attempt, 1);
        let id = first.message_id.clone();
        first.settle(Disposition::Nack).await.unwrap();

        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.attempt, 2);
        assert_eq!(second.message_id, id);
        second.settle(Disposition::Nack).await.unwrap();

        let stats = backbone.stats(Topic::EmergencyAlerts).unwrap();
        assert_eq!(stats.nacked, 2);
        assert_eq!(stats.redelivered, 1);
        assert_eq!(stats.dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_single_consumer_per_subscription() {
        let backbone = MemoryBackbone::new();
        provisioned(&backbone).await;
        let _stream = backbone.pull(Topic::EmergencyAlerts).await.unwrap();
        assert!(backbone.pull(Topic::EmergencyAlerts).await.is_err());
    }
}
