//! The seam between the bus adapter and a concrete message backbone.

use alertcast_sdk::objects::Attributes;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use thiserror::Error;

use super::Topic;

/// Backbone-assigned message id.
pub type MessageId = String;

/// Stream of deliveries for one subscription.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BusError>>;

#[derive(Debug, Error)]
pub enum BusError {
    /// The backbone could not be reached at all.
    #[error("message backbone unavailable: {0}")]
    Unavailable(String),

    /// The backbone answered with an error.
    #[error("backbone error: {0}")]
    Backbone(String),

    #[error("unknown subscription: {0}")]
    UnknownSubscription(String),
}

/// Outcome of an idempotent provisioning call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    Created,
    AlreadyExists,
    /// The backbone has nothing to provision.
    Skipped,
}

/// What to tell the backbone about a delivery once it was processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Ask for redelivery.
    Nack,
}

/// Acknowledges one delivery. Consumed on use.
#[async_trait]
pub trait Acker: Send {
    async fn ack(self: Box<Self>) -> Result<(), BusError>;
    async fn nack(self: Box<Self>) -> Result<(), BusError>;
}

/// One message handed out by a subscription.
pub struct Delivery {
    pub message_id: MessageId,
    pub data: Bytes,
    pub attributes: Attributes,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(
        message_id: MessageId,
        data: Bytes,
        attributes: Attributes,
        attempt: u32,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            message_id,
            data,
            attributes,
            attempt,
            acker,
        }
    }

    pub async fn settle(self, disposition: Disposition) -> Result<(), BusError> {
        match disposition {
            Disposition::Ack => self.acker.ack().await,
            Disposition::Nack => self.acker.nack().await,
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message_id", &self.message_id)
            .field("bytes", &self.data.len())
            .field("attributes", &self.attributes)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// A pub/sub backbone with durable, acknowledged subscriptions.
///
/// Every topic has exactly one subscription, named after it (see
/// [`Topic::subscription`]).
#[async_trait]
pub trait Backbone: Send + Sync + 'static {
    /// Short name for logs and `/stats`.
    fn name(&self) -> &'static str;

    async fn ensure_topic(&self, topic: Topic) -> Result<Provisioned, BusError>;

    async fn ensure_subscription(&self, topic: Topic) -> Result<Provisioned, BusError>;

    async fn publish(
        &self,
        topic: Topic,
        data: Bytes,
        attributes: &Attributes,
    ) -> Result<MessageId, BusError>;

    /// Start pulling from the topic's subscription.
    async fn pull(&self, topic: Topic) -> Result<DeliveryStream, BusError>;
}
