use alertcast_sdk::objects::Attributes;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream;
use tracing::debug;
use uuid::Uuid;

use super::Topic;
use super::backbone::{Backbone, BusError, DeliveryStream, MessageId, Provisioned};

/// Backbone used when none is configured or the real one is unreachable.
///
/// Publishing succeeds with a synthetic `local-<uuid>` id and goes nowhere;
/// subscriptions stay open and never deliver. Direct gateway broadcasts keep
/// working, which is what degraded mode amounts to.
#[derive(Debug, Default)]
pub struct NoopBackbone;

#[async_trait]
impl Backbone for NoopBackbone {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn ensure_topic(&self, _topic: Topic) -> Result<Provisioned, BusError> {
        Ok(Provisioned::Skipped)
    }

    async fn ensure_subscription(&self, _topic: Topic) -> Result<Provisioned, BusError> {
        Ok(Provisioned::Skipped)
    }

    async fn publish(
        &self,
        topic: Topic,
        _data: Bytes,
        _attributes: &Attributes,
    ) -> Result<MessageId, BusError> {
        let id = format!("local-{}", Uuid::new_v4());
        debug!(%topic, message_id = %id, "No backbone, message acknowledged locally");
        Ok(id)
    }

    async fn pull(&self, _topic: Topic) -> Result<DeliveryStream, BusError> {
        Ok(stream::pending().boxed())
    }
}
