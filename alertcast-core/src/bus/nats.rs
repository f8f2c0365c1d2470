//! NATS JetStream backbone.
//!
//! Each topic maps to one stream with a single subject; each subscription is
//! a durable pull consumer with explicit acks on that stream. Message
//! attributes travel as NATS headers.

use alertcast_sdk::objects::Attributes;
use async_nats::jetstream::{self, AckKind, consumer, stream};
use async_nats::{HeaderMap, jetstream::consumer::PullConsumer};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tracing::{debug, info};

use super::Topic;
use super::backbone::{Acker, Backbone, BusError, Delivery, DeliveryStream, MessageId, Provisioned};
use crate::config::BusConfig;

pub struct NatsBackbone {
    jetstream: jetstream::Context,
    prefix: String,
    ack_wait: std::time::Duration,
    max_deliver: i64,
}

impl NatsBackbone {
    /// Connect to the server named in `config`.
    ///
    /// Fails fast with [`BusError::Unavailable`] when the server cannot be
    /// reached, so the caller can fall back to degraded mode.
    pub async fn connect(config: &BusConfig) -> Result<Self, BusError> {
        let client = async_nats::ConnectOptions::new()
            .name("alertcast")
            .connection_timeout(config.connect_timeout)
            .connect(config.url.as_str())
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;

        info!(url = %config.url, "Connected to NATS");

        Ok(Self {
            jetstream: jetstream::new(client),
            prefix: config.stream_prefix.clone(),
            ack_wait: config.ack_wait,
            max_deliver: config.max_deliver,
        })
    }

    fn stream_name(&self, topic: Topic) -> String {
        stream_name(&self.prefix, topic)
    }

    fn subject(&self, topic: Topic) -> String {
        subject(&self.prefix, topic)
    }

    async fn consumer(&self, topic: Topic) -> Result<PullConsumer, BusError> {
        let stream = self
            .jetstream
            .get_stream(self.stream_name(topic))
            .await
            .map_err(backbone_error)?;
        stream
            .get_consumer(topic.subscription())
            .await
            .map_err(backbone_error)
    }
}

/// Stream names may not contain `.`; keep them upper-case by convention.
fn stream_name(prefix: &str, topic: Topic) -> String {
    format!("{prefix}_{topic}")
        .to_ascii_uppercase()
        .replace(['-', '.'], "_")
}

fn subject(prefix: &str, topic: Topic) -> String {
    format!("{}.{topic}", prefix.to_ascii_lowercase())
}

fn backbone_error(e: impl std::fmt::Display) -> BusError {
    BusError::Backbone(e.to_string())
}

#[async_trait]
impl Backbone for NatsBackbone {
    fn name(&self) -> &'static str {
        "nats"
    }

    async fn ensure_topic(&self, topic: Topic) -> Result<Provisioned, BusError> {
        let name = self.stream_name(topic);
        if self.jetstream.get_stream(&name).await.is_ok() {
            return Ok(Provisioned::AlreadyExists);
        }
        self.jetstream
            .create_stream(stream::Config {
                name,
                subjects: vec![self.subject(topic)],
                ..Default::default()
            })
            .await
            .map_err(backbone_error)?;
        Ok(Provisioned::Created)
    }

    async fn ensure_subscription(&self, topic: Topic) -> Result<Provisioned, BusError> {
        let stream = self
            .jetstream
            .get_stream(self.stream_name(topic))
            .await
            .map_err(backbone_error)?;

        let name = topic.subscription();
        if stream.get_consumer::<consumer::pull::Config>(name).await.is_ok() {
            return Ok(Provisioned::AlreadyExists);
        }
        stream
            .create_consumer(consumer::pull::Config {
                durable_name: Some(name.to_owned()),
                ack_policy: consumer::AckPolicy::Explicit,
                ack_wait: self.ack_wait,
                max_deliver: self.max_deliver,
                ..Default::default()
            })
            .await
            .map_err(backbone_error)?;
        Ok(Provisioned::Created)
    }

    async fn publish(
        &self,
        topic: Topic,
        data: Bytes,
        attributes: &Attributes,
    ) -> Result<MessageId, BusError> {
        let mut headers = HeaderMap::new();
        for (key, value) in attributes {
            headers.insert(key.as_str(), value.as_str());
        }

        let ack = self
            .jetstream
            .publish_with_headers(self.subject(topic), headers, data)
            .await
            .map_err(backbone_error)?
            .await
            .map_err(backbone_error)?;

        debug!(%topic, stream = %ack.stream, sequence = ack.sequence, "Published to JetStream");
        Ok(format!("{}:{}", ack.stream, ack.sequence))
    }

    async fn pull(&self, topic: Topic) -> Result<DeliveryStream, BusError> {
        let messages = self
            .consumer(topic)
            .await?
            .messages()
            .await
            .map_err(backbone_error)?;

        let stream = messages.map(|next| {
            let message = next.map_err(backbone_error)?;
            let (message_id, attempt) = match message.info() {
                Ok(info) => (
                    format!("{}:{}", info.stream, info.stream_sequence),
                    u32::try_from(info.delivered).unwrap_or(u32::MAX),
                ),
                Err(_) => (String::new(), 1),
            };
            let data = message.payload.clone();
            let attributes = message
                .headers
                .as_ref()
                .map(attributes_from_headers)
                .unwrap_or_default();

            Ok(Delivery::new(
                message_id,
                data,
                attributes,
                attempt,
                Box::new(NatsAcker { message }),
            ))
        });
        Ok(stream.boxed())
    }
}

fn attributes_from_headers(headers: &HeaderMap) -> Attributes {
    headers
        .iter()
        .filter_map(|(name, values)| {
            let value = values.first()?;
            Some((<async_nats::HeaderName as AsRef<str>>::as_ref(name).to_owned(), value.as_str().to_owned()))
        })
        .collect()
}

struct NatsAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acker for NatsAcker {
    async fn ack(self: Box<Self>) -> Result<(), BusError> {
        self.message.ack().await.map_err(backbone_error)
    }

    async fn nack(self: Box<Self>) -> Result<(), BusError> {
        self.message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(backbone_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_names_are_nats_safe() {
        assert_eq!(stream_name("alertcast", Topic::EmergencyAlerts), "ALERTCAST_EMERGENCY_ALERTS");
        assert_eq!(stream_name("prod.eu", Topic::SystemNotifications), "PROD_EU_SYSTEM_NOTIFICATIONS");
    }

    #[test]
    fn test_subjects() {
        assert_eq!(subject("Alertcast", Topic::DisasterWarnings), "alertcast.disaster-warnings");
    }
}
