//! Message bus adapter.
//!
//! [`MessageBus`] is the only thing the rest of the crate knows about the
//! pub/sub backbone. It owns the fixed topic set, stamps attributes on
//! publish, and runs one consumer task per subscription that decodes,
//! dispatches and acknowledges deliveries.
//!
//! Backbones live behind the [`Backbone`] trait:
//!
//! - [`NatsBackbone`]: NATS JetStream, the production backbone
//! - [`MemoryBackbone`]: in-process queues with redelivery
//! - [`NoopBackbone`]: degraded mode, nothing is transported

mod backbone;
mod memory;
mod nats;
mod noop;
mod publisher;

pub use backbone::{
    Acker, Backbone, BusError, Delivery, DeliveryStream, Disposition, MessageId, Provisioned,
};
pub use memory::{MemoryBackbone, SubscriptionStats};
pub use nats::NatsBackbone;
pub use noop::NoopBackbone;
pub use publisher::{AlertPublisher, PublishedAlert};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use alertcast_sdk::objects::{AlertKind, Attributes, attribute};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{BackboneKind, BusConfig};

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// The fixed set of alert topics. Each has exactly one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    EmergencyAlerts,
    DisasterWarnings,
    EvacuationNotices,
    SystemNotifications,
}

impl Topic {
    pub const ALL: [Topic; 4] = [
        Topic::EmergencyAlerts,
        Topic::DisasterWarnings,
        Topic::EvacuationNotices,
        Topic::SystemNotifications,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Topic::EmergencyAlerts => "emergency-alerts",
            Topic::DisasterWarnings => "disaster-warnings",
            Topic::EvacuationNotices => "evacuation-notices",
            Topic::SystemNotifications => "system-notifications",
        }
    }

    /// Subscription name: `<topic>-subscription`.
    pub const fn subscription(&self) -> &'static str {
        match self {
            Topic::EmergencyAlerts => "emergency-alerts-subscription",
            Topic::DisasterWarnings => "disaster-warnings-subscription",
            Topic::EvacuationNotices => "evacuation-notices-subscription",
            Topic::SystemNotifications => "system-notifications-subscription",
        }
    }

    pub fn from_subscription(name: &str) -> Option<Topic> {
        Topic::ALL.into_iter().find(|t| t.subscription() == name)
    }

    pub const fn kind(&self) -> AlertKind {
        match self {
            Topic::EmergencyAlerts => AlertKind::EmergencyAlert,
            Topic::DisasterWarnings => AlertKind::DisasterWarning,
            Topic::EvacuationNotices => AlertKind::EvacuationNotice,
            Topic::SystemNotifications => AlertKind::SystemNotification,
        }
    }

    pub const fn for_kind(kind: AlertKind) -> Topic {
        match kind {
            AlertKind::EmergencyAlert => Topic::EmergencyAlerts,
            AlertKind::DisasterWarning => Topic::DisasterWarnings,
            AlertKind::EvacuationNotice => Topic::EvacuationNotices,
            AlertKind::SystemNotification => Topic::SystemNotifications,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown topic: {0}")]
pub struct UnknownTopic(pub String);

impl FromStr for Topic {
    type Err = UnknownTopic;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownTopic(s.to_owned()))
    }
}

// ---------------------------------------------------------------------------
// Errors and reports
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    UnknownTopic(#[from] UnknownTopic),

    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid alert: {0}")]
    InvalidAlert(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Why a delivery was not processed. Always results in a nack.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("message body is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{0}")]
    Failed(String),
}

/// Per-resource result of [`MessageBus::ensure_topology`].
#[derive(Debug, Default)]
pub struct ProvisionReport {
    pub topics: Vec<(Topic, Result<Provisioned, BusError>)>,
    pub subscriptions: Vec<(Topic, Result<Provisioned, BusError>)>,
}

impl ProvisionReport {
    pub fn failures(&self) -> usize {
        self.topics
            .iter()
            .chain(&self.subscriptions)
            .filter(|(_, r)| r.is_err())
            .count()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// A decoded delivery as seen by a handler.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: Topic,
    pub message_id: MessageId,
    pub data: Value,
    pub attributes: Attributes,
    pub attempt: u32,
}

/// Consumer-side callback. `Ok` acks the delivery, `Err` nacks it.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: InboundMessage) -> Result<(), HandlerError>;
}

// ---------------------------------------------------------------------------
// MessageBus
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MessageBus {
    backbone: Arc<dyn Backbone>,
}

impl MessageBus {
    pub fn new(backbone: Arc<dyn Backbone>) -> Self {
        Self { backbone }
    }

    /// Build the bus described by `config`.
    ///
    /// An unreachable NATS server is not fatal: the bus comes up on the
    /// [`NoopBackbone`] and the process keeps serving direct broadcasts.
    pub async fn from_config(config: &BusConfig) -> Self {
        let backbone: Arc<dyn Backbone> = match config.backbone {
            BackboneKind::Nats => match NatsBackbone::connect(config).await {
                Ok(nats) => Arc::new(nats),
                Err(e) => {
                    warn!(error = %e, "Message backbone unavailable, running in direct-broadcast-only mode");
                    Arc::new(NoopBackbone)
                }
            },
            BackboneKind::Memory => {
                let max_deliver = u32::try_from(config.max_deliver.max(0)).unwrap_or(0);
                Arc::new(MemoryBackbone::new().with_max_deliver(max_deliver))
            }
            BackboneKind::Disabled => Arc::new(NoopBackbone),
        };
        info!(backbone = backbone.name(), "Message bus ready");
        Self::new(backbone)
    }

    pub fn backbone_name(&self) -> &'static str {
        self.backbone.name()
    }

    /// `true` when messages are not actually transported.
    pub fn is_degraded(&self) -> bool {
        self.backbone.name() == NoopBackbone.name()
    }

    /// Create every topic, then every subscription. Idempotent; one failing
    /// resource does not stop the others.
    pub async fn ensure_topology(&self, topics: &[Topic]) -> ProvisionReport {
        let mut report = ProvisionReport::default();

        for &topic in topics {
            let result = self.backbone.ensure_topic(topic).await;
            match &result {
                Ok(outcome) => info!(%topic, ?outcome, "Topic ready"),
                Err(e) => error!(%topic, error = %e, "Failed to provision topic"),
            }
            report.topics.push((topic, result));
        }

        for &topic in topics {
            let result = self.backbone.ensure_subscription(topic).await;
            match &result {
                Ok(outcome) => {
                    info!(subscription = topic.subscription(), ?outcome, "Subscription ready")
                }
                Err(e) => error!(
                    subscription = topic.subscription(),
                    error = %e,
                    "Failed to provision subscription"
                ),
            }
            report.subscriptions.push((topic, result));
        }

        report
    }

    /// Publish `payload` as JSON to `topic`.
    ///
    /// Attributes are `{timestamp}` merged with `attributes`; caller keys
    /// win. An unknown topic fails before the backbone is contacted.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        payload: &T,
        attributes: Attributes,
    ) -> Result<MessageId, PublishError> {
        let topic: Topic = topic.parse()?;
        let data = Bytes::from(serde_json::to_vec(payload)?);

        let mut merged = Attributes::new();
        if let Ok(now) = OffsetDateTime::now_utc().format(&Rfc3339) {
            merged.insert(attribute::TIMESTAMP.to_owned(), now);
        }
        merged.extend(attributes);

        let id = self.backbone.publish(topic, data, &merged).await?;
        debug!(%topic, message_id = %id, "Message published");
        Ok(id)
    }

    /// Start consuming `subscription` on a background task.
    ///
    /// Each delivery is decoded as JSON and passed to `handler`. Successful
    /// handling acks; a decode failure or a handler error nacks. The task
    /// ends on shutdown or when the backbone closes the stream.
    pub fn subscribe(
        &self,
        subscription: &str,
        handler: Arc<dyn MessageHandler>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, BusError> {
        let topic = Topic::from_subscription(subscription)
            .ok_or_else(|| BusError::UnknownSubscription(subscription.to_owned()))?;
        let backbone = Arc::clone(&self.backbone);

        Ok(tokio::spawn(async move {
            let mut deliveries = match backbone.pull(topic).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(subscription = topic.subscription(), error = %e, "Failed to start subscription");
                    return;
                }
            };
            info!(subscription = topic.subscription(), "Listening for messages");

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!(subscription = topic.subscription(), "Subscription received shutdown signal");
                            break;
                        }
                    }

                    next = deliveries.next() => match next {
                        Some(Ok(delivery)) => {
                            consume(topic, handler.as_ref(), delivery).await;
                        }
                        Some(Err(e)) => {
                            warn!(subscription = topic.subscription(), error = %e, "Subscription error");
                        }
                        None => {
                            info!(subscription = topic.subscription(), "Subscription stream ended");
                            break;
                        }
                    }
                }
            }
        }))
    }
}

async fn consume(topic: Topic, handler: &dyn MessageHandler, delivery: Delivery) -> Disposition {
    let result = match serde_json::from_slice::<Value>(&delivery.data) {
        Ok(data) => {
            let message = InboundMessage {
                topic,
                message_id: delivery.message_id.clone(),
                data,
                attributes: delivery.attributes.clone(),
                attempt: delivery.attempt,
            };
            handler.handle(message).await
        }
        Err(e) => Err(HandlerError::Decode(e)),
    };

    let disposition = match result {
        Ok(()) => {
            debug!(%topic, message_id = %delivery.message_id, "Message processed");
            Disposition::Ack
        }
        Err(e) => {
            warn!(
                %topic,
                message_id = %delivery.message_id,
                attempt = delivery.attempt,
                error = %e,
                "Message handling failed, requesting redelivery"
            );
            Disposition::Nack
        }
    };

    if let Err(e) = delivery.settle(disposition).await {
        warn!(%topic, error = %e, "Failed to settle delivery");
    }
    disposition
}
