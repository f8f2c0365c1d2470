//! NotificationRouter processor.
//!
//! Turns bus-originated alerts into gateway broadcasts:
//! - derives target channels from the payload's location (or `area` for
//!   evacuation notices) and from the `region` attribute
//! - frames the payload under its kind and broadcasts it to those channels
//! - escalates `critical` alerts to every open connection
//! - broadcasts system notifications to every open connection
//! - drops bus redeliveries of an alert it routed recently

use std::collections::{HashSet, VecDeque};
use std::convert::Infallible;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use alertcast_sdk::objects::{
    AlertFrame, AlertKind, Attributes, NoticeFrame, NotificationFrame, ServerEvent, Severity,
    WarningFrame, attribute,
};
use async_trait::async_trait;
use kanau::processor::Processor;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::bus::{HandlerError, InboundMessage, MessageHandler};
use crate::config::RoutingConfig;
use crate::events::BusAlert;
use crate::gateway::GatewayHandle;
use crate::registry::Channel;

/// Upper bound on remembered alert ids, whatever the window.
const DEDUP_CAPACITY: usize = 4096;

/// What [`NotificationRouter`] did with one alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Seen within the dedup window; nothing sent.
    Duplicate,
    /// Sent to every open connection.
    BroadcastAll,
    Routed {
        channels: Vec<Channel>,
        /// A `critical-*` copy also went to every open connection.
        escalated: bool,
    },
}

pub struct NotificationRouter {
    gateway: GatewayHandle,
    country: Option<Channel>,
    recent: Mutex<RecentAlerts>,
}

impl NotificationRouter {
    pub fn new(gateway: GatewayHandle, config: &RoutingConfig) -> Self {
        Self {
            gateway,
            country: Channel::country(&config.country),
            recent: Mutex::new(RecentAlerts::new(config.dedup_window, DEDUP_CAPACITY)),
        }
    }

    /// Channels an alert is addressed to, in country, state, city order,
    /// without duplicates.
    pub fn target_channels(&self, alert: &BusAlert) -> Vec<Channel> {
        let mut channels = Vec::new();
        let mut push = |channel: Option<Channel>| {
            if let Some(channel) = channel {
                if !channels.contains(&channel) {
                    channels.push(channel);
                }
            }
        };

        push(self.country.clone());

        let place_key = match alert.kind {
            AlertKind::EvacuationNotice => "area",
            _ => "location",
        };
        if let Some(place) = alert.payload.get(place_key).and_then(Value::as_object) {
            let field = |key: &str| place.get(key).and_then(Value::as_str);
            push(field("state").and_then(Channel::state));
            push(field("city").and_then(Channel::city));
        }

        if let Some(region) = alert.attributes.get(attribute::REGION) {
            if !region.trim().eq_ignore_ascii_case(attribute::REGION_ALL) {
                let mut parts = region.split(',');
                push(parts.next().and_then(Channel::city));
                push(parts.next().and_then(Channel::state));
            }
        }

        channels
    }

    fn is_duplicate(&self, alert: &BusAlert) -> bool {
        let Some(id) = alert.id() else {
            return false;
        };
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .check_and_remember(alert.kind, id, Instant::now())
    }
}

fn is_critical(attributes: &Attributes) -> bool {
    attributes
        .get(attribute::SEVERITY)
        .and_then(|s| s.parse::<Severity>().ok())
        == Some(Severity::Critical)
}

/// The payload framed under its own kind.
fn frame(kind: AlertKind, payload: Value, attributes: Attributes) -> ServerEvent {
    match kind {
        AlertKind::EmergencyAlert => ServerEvent::EmergencyAlert(AlertFrame {
            alert: payload,
            attributes,
            proximity: None,
        }),
        AlertKind::DisasterWarning => ServerEvent::DisasterWarning(WarningFrame {
            warning: payload,
            attributes,
            proximity: None,
        }),
        AlertKind::EvacuationNotice => ServerEvent::EvacuationNotice(NoticeFrame {
            notice: payload,
            attributes,
            proximity: None,
        }),
        AlertKind::SystemNotification => ServerEvent::SystemNotification(NotificationFrame {
            notification: payload,
            attributes,
        }),
    }
}

/// Global fan-out variant for critical severity.
fn critical_frame(kind: AlertKind, payload: Value, attributes: Attributes) -> ServerEvent {
    match kind {
        AlertKind::EvacuationNotice => ServerEvent::CriticalEvacuation(NoticeFrame {
            notice: payload,
            attributes,
            proximity: None,
        }),
        _ => ServerEvent::CriticalAlert(AlertFrame {
            alert: payload,
            attributes,
            proximity: None,
        }),
    }
}

// ---------------------------------------------------------------------------
// Processor trait implementation
// ---------------------------------------------------------------------------

impl Processor<BusAlert> for NotificationRouter {
    type Output = RouteOutcome;
    type Error = Infallible;

    async fn process(&self, alert: BusAlert) -> Result<RouteOutcome, Infallible> {
        if self.is_duplicate(&alert) {
            debug!(kind = %alert.kind, id = ?alert.id(), "Alert already routed, skipping redelivery");
            return Ok(RouteOutcome::Duplicate);
        }

        if alert.kind == AlertKind::SystemNotification {
            info!(id = ?alert.id(), "Broadcasting system notification");
            let event = frame(alert.kind, alert.payload, alert.attributes);
            self.gateway.broadcast_to_all(Arc::new(event)).await;
            return Ok(RouteOutcome::BroadcastAll);
        }

        let channels = self.target_channels(&alert);
        let escalated = is_critical(&alert.attributes);
        info!(
            kind = %alert.kind,
            id = ?alert.id(),
            channels = ?channels.iter().map(ToString::to_string).collect::<Vec<_>>(),
            escalated,
            "Routing alert"
        );

        let BusAlert {
            kind,
            payload,
            attributes,
        } = alert;

        let critical = escalated.then(|| critical_frame(kind, payload.clone(), attributes.clone()));
        self.gateway
            .broadcast_to_channels(channels.clone(), Arc::new(frame(kind, payload, attributes)))
            .await;
        if let Some(critical) = critical {
            self.gateway.broadcast_to_all(Arc::new(critical)).await;
        }

        Ok(RouteOutcome::Routed {
            channels,
            escalated,
        })
    }
}

/// Bus handler feeding one subscription into the router.
pub struct RouterSubscription {
    router: Arc<NotificationRouter>,
}

impl RouterSubscription {
    pub fn new(router: Arc<NotificationRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl MessageHandler for RouterSubscription {
    async fn handle(&self, message: InboundMessage) -> Result<(), HandlerError> {
        let alert = BusAlert::new(message.topic.kind(), message.data, message.attributes);
        match self.router.process(alert).await {
            Ok(_) => Ok(()),
            Err(never) => match never {},
        }
    }
}

// ---------------------------------------------------------------------------
// Dedup cache
// ---------------------------------------------------------------------------

/// `(kind, id)` pairs routed within the last `window`, oldest first.
struct RecentAlerts {
    window: Duration,
    capacity: usize,
    order: VecDeque<((AlertKind, String), Instant)>,
    seen: HashSet<(AlertKind, String)>,
}

impl RecentAlerts {
    fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity,
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Returns `true` if the pair was already present; remembers it otherwise.
    fn check_and_remember(&mut self, kind: AlertKind, id: &str, now: Instant) -> bool {
        while let Some((key, at)) = self.order.front() {
            if now.duration_since(*at) < self.window {
                break;
            }
            self.seen.remove(key);
            self.order.pop_front();
        }

        if self.window.is_zero() {
            return false;
        }
        let key = (kind, id.to_owned());
        if self.seen.contains(&key) {
            return true;
        }
        while self.order.len() >= self.capacity {
            match self.order.pop_front() {
                Some((evicted, _)) => {
                    self.seen.remove(&evicted);
                }
                None => break,
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back((key, now));
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Hub, OutboundReceiver};
    use crate::registry::ConnectionRegistry;
    use alertcast_sdk::objects::RegisterPayload;
    use serde_json::json;
    use tokio::sync::watch;

    struct Fixture {
        gateway: GatewayHandle,
        router: NotificationRouter,
        _shutdown: watch::Sender<bool>,
    }

    fn fixture(dedup_window: Duration) -> Fixture {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (gateway, _task) = GatewayHandle::spawn(Hub::new(ConnectionRegistry::new("india")), shutdown_rx);
        let config = RoutingConfig {
            country: "india".to_owned(),
            dedup_window,
        };
        Fixture {
            router: NotificationRouter::new(gateway.clone(), &config),
            gateway,
            _shutdown: shutdown,
        }
    }

    async fn join(gateway: &GatewayHandle, user: &str, location: Option<Value>) -> OutboundReceiver {
        let (id, mut rx) = gateway.connect().await.unwrap();
        gateway
            .register(
                id,
                RegisterPayload {
                    user_id: Some(user.to_owned()),
                    location,
                },
            )
            .await
            .unwrap();
        // Registration ack.
        rx.recv().await.unwrap();
        rx
    }

    async fn received(gateway: &GatewayHandle, rx: &mut OutboundReceiver) -> Vec<&'static str> {
        gateway.stats().await.unwrap();
        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        names
    }

    fn alert(kind: AlertKind, payload: Value, attrs: &[(&str, &str)]) -> BusAlert {
        let attributes = attrs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        BusAlert::new(kind, payload, attributes)
    }

    fn keys(channels: &[Channel]) -> Vec<String> {
        channels.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn test_target_channels_from_location_and_region() {
        let f = fixture(Duration::ZERO);
        let a = alert(
            AlertKind::EmergencyAlert,
            json!({"location": {"city": "Mumbai", "state": "Maharashtra"}}),
            &[("region", "Pune,Maharashtra")],
        );
        assert_eq!(
            keys(&f.router.target_channels(&a)),
            ["country:india", "state:maharashtra", "city:mumbai", "city:pune"]
        );
    }

    #[tokio::test]
    async fn test_region_string_matches_structured_location() {
        let f = fixture(Duration::ZERO);
        let structured = alert(
            AlertKind::DisasterWarning,
            json!({"location": {"city": "NAVI Mumbai", "state": "Maharashtra"}}),
            &[],
        );
        let flat = alert(
            AlertKind::DisasterWarning,
            json!({}),
            &[("region", " navi mumbai , maharashtra ")],
        );
        let mut a = f.router.target_channels(&structured);
        let mut b = f.router.target_channels(&flat);
        a.sort();
        b.sort();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_region_all_and_missing_location_fall_back_to_country() {
        let f = fixture(Duration::ZERO);
        let a = alert(AlertKind::EmergencyAlert, json!({"title": "x"}), &[("region", "ALL")]);
        assert_eq!(keys(&f.router.target_channels(&a)), ["country:india"]);
    }

    #[tokio::test]
    async fn test_evacuation_uses_area() {
        let f = fixture(Duration::ZERO);
        let a = alert(
            AlertKind::EvacuationNotice,
            json!({"area": {"city": "Surat"}, "location": {"city": "Ignored"}}),
            &[],
        );
        assert_eq!(keys(&f.router.target_channels(&a)), ["country:india", "city:surat"]);
    }

    #[tokio::test]
    async fn test_routes_to_matching_city_only() {
        let f = fixture(Duration::ZERO);
        let mut mumbai = join(&f.gateway, "u1", Some(json!({"lat": 19.0, "lng": 72.8, "city": "Mumbai"}))).await;
        let mut anonymous = join(&f.gateway, "u2", None).await;

        let outcome = f
            .router
            .process(alert(
                AlertKind::DisasterWarning,
                json!({"id": "w1", "location": {"city": "Mumbai"}}),
                &[("severity", "high")],
            ))
            .await
            .unwrap();

        assert!(matches!(outcome, RouteOutcome::Routed { escalated: false, .. }));
        assert_eq!(received(&f.gateway, &mut mumbai).await, ["disaster-warning"]);
        assert!(received(&f.gateway, &mut anonymous).await.is_empty());
    }

    #[tokio::test]
    async fn test_critical_escalates_to_everyone() {
        let f = fixture(Duration::ZERO);
        let mut pune = join(&f.gateway, "u1", Some(json!({"lat": 18.5, "lng": 73.8, "city": "Pune"}))).await;
        let mut anonymous = join(&f.gateway, "u2", None).await;

        let outcome = f
            .router
            .process(alert(
                AlertKind::EmergencyAlert,
                json!({"id": "e1", "location": {"city": "Mumbai"}}),
                &[("severity", "critical")],
            ))
            .await
            .unwrap();

        assert!(matches!(outcome, RouteOutcome::Routed { escalated: true, .. }));
        // Pune is in country:india, so it gets the channel copy too.
        assert_eq!(received(&f.gateway, &mut pune).await, ["emergency-alert", "critical-alert"]);
        assert_eq!(received(&f.gateway, &mut anonymous).await, ["critical-alert"]);
    }

    #[tokio::test]
    async fn test_critical_evacuation_variant() {
        let f = fixture(Duration::ZERO);
        let mut anonymous = join(&f.gateway, "u2", None).await;
        f.router
            .process(alert(
                AlertKind::EvacuationNotice,
                json!({"id": "v1", "area": {"city": "Surat"}}),
                &[("severity", "Critical")],
            ))
            .await
            .unwrap();
        assert_eq!(received(&f.gateway, &mut anonymous).await, ["critical-evacuation"]);
    }

    #[tokio::test]
    async fn test_system_notification_goes_to_all() {
        let f = fixture(Duration::ZERO);
        let mut anonymous = join(&f.gateway, "u2", None).await;
        let (_unregistered, mut raw) = f.gateway.connect().await.unwrap();

        let outcome = f
            .router
            .process(alert(AlertKind::SystemNotification, json!({"message": "maintenance"}), &[]))
            .await
            .unwrap();

        assert_eq!(outcome, RouteOutcome::BroadcastAll);
        assert_eq!(received(&f.gateway, &mut anonymous).await, ["system-notification"]);
        assert_eq!(received(&f.gateway, &mut raw).await, ["system-notification"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redelivery_within_window_is_dropped() {
        let f = fixture(Duration::from_secs(60));
        let a = alert(AlertKind::EmergencyAlert, json!({"id": "e1"}), &[]);

        assert!(matches!(f.router.process(a.clone()).await.unwrap(), RouteOutcome::Routed { .. }));
        assert_eq!(f.router.process(a.clone()).await.unwrap(), RouteOutcome::Duplicate);

        // Same id under another kind is a different alert.
        let other = alert(AlertKind::DisasterWarning, json!({"id": "e1"}), &[]);
        assert!(matches!(f.router.process(other).await.unwrap(), RouteOutcome::Routed { .. }));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(matches!(f.router.process(a).await.unwrap(), RouteOutcome::Routed { .. }));
    }

    #[test]
    fn test_recent_alerts_capacity() {
        let mut recent = RecentAlerts::new(Duration::from_secs(60), 2);
        let now = Instant::now();
        assert!(!recent.check_and_remember(AlertKind::EmergencyAlert, "a", now));
        assert!(!recent.check_and_remember(AlertKind::EmergencyAlert, "b", now));
        assert!(!recent.check_and_remember(AlertKind::EmergencyAlert, "c", now));
        // "a" was evicted to make room.
        assert!(!recent.check_and_remember(AlertKind::EmergencyAlert, "a", now));
        assert!(recent.check_and_remember(AlertKind::EmergencyAlert, "c", now));
    }
}
