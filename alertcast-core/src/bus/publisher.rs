use alertcast_sdk::objects::{AlertKind, Attributes, attribute};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::info;

use super::{MessageBus, MessageId, PublishError, Topic};

/// An alert accepted by the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedAlert {
    /// The alert's own id (stamped if the body had none).
    pub id: String,
    /// The backbone's message id.
    pub message_id: MessageId,
}

/// Producer-side helper: validates an alert body, stamps id, timestamp and
/// status, derives routing attributes and publishes to the kind's topic.
#[derive(Clone)]
pub struct AlertPublisher {
    bus: MessageBus,
}

impl AlertPublisher {
    pub fn new(bus: MessageBus) -> Self {
        Self { bus }
    }

    pub async fn publish(&self, kind: AlertKind, body: Value) -> Result<PublishedAlert, PublishError> {
        let Value::Object(mut body) = body else {
            return Err(PublishError::InvalidAlert(
                "alert body must be a JSON object".to_owned(),
            ));
        };
        for field in required_fields(kind) {
            if body.get(*field).is_none_or(is_blank) {
                return Err(PublishError::InvalidAlert(format!(
                    "{kind} requires `{field}`"
                )));
            }
        }

        let now = OffsetDateTime::now_utc();
        let id = match body.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_owned(),
            _ => format!("{}-{}", id_prefix(kind), now.unix_timestamp_nanos() / 1_000_000),
        };
        body.insert("id".to_owned(), Value::String(id.clone()));
        if !body.contains_key("timestamp") {
            if let Ok(ts) = now.format(&Rfc3339) {
                body.insert("timestamp".to_owned(), Value::String(ts));
            }
        }
        if kind != AlertKind::SystemNotification {
            body.entry("status")
                .or_insert_with(|| Value::String("active".to_owned()));
        }
        if kind == AlertKind::EvacuationNotice {
            body.insert("type".to_owned(), Value::String("evacuation".to_owned()));
        }

        let attributes = routing_attributes(kind, &body);
        let message_id = self
            .bus
            .publish(Topic::for_kind(kind).as_str(), &body, attributes)
            .await?;

        info!(%kind, alert_id = %id, %message_id, "Alert published");
        Ok(PublishedAlert { id, message_id })
    }

    pub async fn emergency_alert(&self, body: Value) -> Result<PublishedAlert, PublishError> {
        self.publish(AlertKind::EmergencyAlert, body).await
    }

    pub async fn disaster_warning(&self, body: Value) -> Result<PublishedAlert, PublishError> {
        self.publish(AlertKind::DisasterWarning, body).await
    }

    pub async fn evacuation_notice(&self, body: Value) -> Result<PublishedAlert, PublishError> {
        self.publish(AlertKind::EvacuationNotice, body).await
    }

    pub async fn system_notification(&self, body: Value) -> Result<PublishedAlert, PublishError> {
        self.publish(AlertKind::SystemNotification, body).await
    }
}

fn required_fields(kind: AlertKind) -> &'static [&'static str] {
    match kind {
        AlertKind::EmergencyAlert => &["title", "message", "location"],
        AlertKind::DisasterWarning => &["title", "location"],
        AlertKind::EvacuationNotice => &["area", "reason"],
        AlertKind::SystemNotification => &["message"],
    }
}

fn id_prefix(kind: AlertKind) -> &'static str {
    match kind {
        AlertKind::EmergencyAlert => "alert",
        AlertKind::DisasterWarning => "warning",
        AlertKind::EvacuationNotice => "evac",
        AlertKind::SystemNotification => "notice",
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn text<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// `severity` (default `high`), `type` and `region` (default `all`).
fn routing_attributes(kind: AlertKind, body: &Map<String, Value>) -> Attributes {
    let severity = text(body, "severity").unwrap_or("high");
    let alert_type = match kind {
        AlertKind::EvacuationNotice => "evacuation",
        AlertKind::EmergencyAlert => text(body, "type").unwrap_or("emergency"),
        AlertKind::DisasterWarning => text(body, "type").unwrap_or("warning"),
        AlertKind::SystemNotification => text(body, "type").unwrap_or("system"),
    };

    let derived_region = match kind {
        AlertKind::DisasterWarning => body.get("location").and_then(Value::as_object).and_then(|loc| {
            Some(format!("{},{}", text(loc, "city")?, text(loc, "state")?))
        }),
        AlertKind::EvacuationNotice => body
            .get("area")
            .and_then(Value::as_object)
            .and_then(|area| text(area, "region"))
            .map(str::to_owned),
        _ => None,
    };
    let region = text(body, "region")
        .map(str::to_owned)
        .or(derived_region)
        .unwrap_or_else(|| attribute::REGION_ALL.to_owned());

    Attributes::from([
        (attribute::SEVERITY.to_owned(), severity.to_owned()),
        (attribute::TYPE.to_owned(), alert_type.to_owned()),
        (attribute::REGION.to_owned(), region),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{HandlerError, InboundMessage, MemoryBackbone, MessageHandler};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::{mpsc, watch};

    struct Forward(mpsc::UnboundedSender<InboundMessage>);

    #[async_trait]
    impl MessageHandler for Forward {
        async fn handle(&self, message: InboundMessage) -> Result<(), HandlerError> {
            let _ = self.0.send(message);
            Ok(())
        }
    }

    async fn setup(topic: Topic) -> (AlertPublisher, mpsc::UnboundedReceiver<InboundMessage>, watch::Sender<bool>) {
        let bus = MessageBus::new(Arc::new(MemoryBackbone::new()));
        bus.ensure_topology(&Topic::ALL).await;
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        bus.subscribe(topic.subscription(), Arc::new(Forward(tx)), shutdown_rx)
            .unwrap();
        (AlertPublisher::new(bus), rx, shutdown_tx)
    }

    #[tokio::test]
    async fn test_emergency_alert_defaults() {
        let (publisher, mut rx, _shutdown) = setup(Topic::EmergencyAlerts).await;
        let published = publisher
            .emergency_alert(json!({"title": "Flood", "message": "Move to higher ground", "location": {"city": "Mumbai"}}))
            .await
            .unwrap();
        assert!(published.id.starts_with("alert-"));

        let message = rx.recv().await.unwrap();
        assert_eq!(message.data["id"], published.id.as_str());
        assert_eq!(message.data["status"], "active");
        assert!(message.data["timestamp"].is_string());
        assert_eq!(message.attributes["severity"], "high");
        assert_eq!(message.attributes["type"], "emergency");
        assert_eq!(message.attributes["region"], "all");
    }

    #[tokio::test]
    async fn test_warning_region_from_location() {
        let (publisher, mut rx, _shutdown) = setup(Topic::DisasterWarnings).await;
        publisher
            .disaster_warning(json!({
                "id": "w-1",
                "title": "Cyclone",
                "severity": "critical",
                "type": "cyclone",
                "location": {"city": "Chennai", "state": "Tamil Nadu"}
            }))
            .await
            .unwrap();

        let message = rx.recv().await.unwrap();
        assert_eq!(message.data["id"], "w-1");
        assert_eq!(message.attributes["region"], "Chennai,Tamil Nadu");
        assert_eq!(message.attributes["severity"], "critical");
        assert_eq!(message.attributes["type"], "cyclone");
    }

    #[tokio::test]
    async fn test_evacuation_requires_area_and_reason() {
        let (publisher, _rx, _shutdown) = setup(Topic::EvacuationNotices).await;
        let err = publisher
            .evacuation_notice(json!({"area": {"region": "Mumbai,Maharashtra"}}))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::InvalidAlert(ref m) if m.contains("reason")));

        let err = publisher.evacuation_notice(json!("leave")).await.unwrap_err();
        assert!(matches!(err, PublishError::InvalidAlert(_)));
    }

    #[tokio::test]
    async fn test_evacuation_type_and_region() {
        let (publisher, mut rx, _shutdown) = setup(Topic::EvacuationNotices).await;
        let published = publisher
            .evacuation_notice(json!({"area": {"region": "Mumbai,Maharashtra"}, "reason": "Dam release"}))
            .await
            .unwrap();
        assert!(published.id.starts_with("evac-"));

        let message = rx.recv().await.unwrap();
        assert_eq!(message.data["type"], "evacuation");
        assert_eq!(message.attributes["type"], "evacuation");
        assert_eq!(message.attributes["region"], "Mumbai,Maharashtra");
    }
}
