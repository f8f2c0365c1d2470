//! Realtime gateway core.
//!
//! The [`Hub`] task owns the [`ConnectionRegistry`] and one bounded outbound
//! queue per open connection. Everything else talks to it through a
//! cloneable [`GatewayHandle`]:
//!
//! - transport edges call `connect` / `register` / `disconnect`
//! - the router and the matcher call `send_to` / `broadcast_*`
//!
//! Sends are fire-and-forget. A full or closed queue drops the frame for
//! that connection only and is logged at debug level.

mod hub;

pub use hub::Hub;

use std::fmt;
use std::sync::Arc;

use alertcast_sdk::objects::{RegisterPayload, ServerEvent};
use compact_str::CompactString;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::events::DEFAULT_CHANNEL_BUFFER;
use crate::registry::{Channel, Connection, ConnectionId, Registration, RegistryError, RegistryStats};
use hub::HubCommand;

/// Frames buffered per connection before new ones are dropped.
pub const OUTBOUND_BUFFER: usize = 64;

/// Receiving half of a connection's outbound queue.
pub type OutboundReceiver = mpsc::Receiver<Arc<ServerEvent>>;

/// Addressee of a direct send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Connection(ConnectionId),
    /// Every connection registered under this user id.
    User(CompactString),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Connection(id) => write!(f, "connection {id}"),
            Target::User(user_id) => write!(f, "user {user_id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub open_connections: usize,
    pub registry: RegistryStats,
    pub frames_dropped: u64,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway hub is not running")]
    HubClosed,

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Cloneable handle to the hub task.
#[derive(Clone)]
pub struct GatewayHandle {
    tx: mpsc::Sender<HubCommand>,
}

impl GatewayHandle {
    /// Spawn `hub` and return a handle to it.
    pub fn spawn(hub: Hub, shutdown_rx: watch::Receiver<bool>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(DEFAULT_CHANNEL_BUFFER);
        let task = tokio::spawn(hub.run(shutdown_rx, rx));
        (Self { tx }, task)
    }

    /// Open a connection and get the receiving end of its outbound queue.
    pub async fn connect(&self) -> Result<(ConnectionId, OutboundReceiver), GatewayError> {
        let id = ConnectionId::new();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        self.request(HubCommand::Connect { id, outbound }).await?;
        Ok((id, outbound_rx))
    }

    /// Register an open connection. The `registered` acknowledgement is
    /// queued to the connection by the hub in both the success and the
    /// rejection case.
    pub async fn register(
        &self,
        id: ConnectionId,
        payload: RegisterPayload,
    ) -> Result<Registration, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.request(HubCommand::Register { id, payload, reply }).await?;
        Ok(rx.await.map_err(|_| GatewayError::HubClosed)??)
    }

    /// Close a connection and remove it from the registry.
    pub async fn disconnect(&self, id: ConnectionId) {
        self.fire(HubCommand::Disconnect { id }).await;
    }

    pub async fn send_to(&self, target: Target, event: Arc<ServerEvent>) {
        self.fire(HubCommand::SendTo { target, event }).await;
    }

    pub async fn broadcast_to_channel(&self, channel: Channel, event: Arc<ServerEvent>) {
        self.broadcast_to_channels(vec![channel], event).await;
    }

    /// Deliver once to every connection that is a member of at least one of
    /// `channels`.
    pub async fn broadcast_to_channels(&self, channels: Vec<Channel>, event: Arc<ServerEvent>) {
        self.fire(HubCommand::Broadcast { channels, event }).await;
    }

    /// Deliver to every open connection, registered or not.
    pub async fn broadcast_to_all(&self, event: Arc<ServerEvent>) {
        self.fire(HubCommand::BroadcastAll { event }).await;
    }

    pub async fn snapshot(&self) -> Result<Vec<Arc<Connection>>, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.request(HubCommand::Snapshot { reply }).await?;
        rx.await.map_err(|_| GatewayError::HubClosed)
    }

    pub async fn stats(&self) -> Result<HubStats, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.request(HubCommand::Stats { reply }).await?;
        rx.await.map_err(|_| GatewayError::HubClosed)
    }

    async fn request(&self, command: HubCommand) -> Result<(), GatewayError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| GatewayError::HubClosed)
    }

    async fn fire(&self, command: HubCommand) {
        if self.tx.send(command).await.is_err() {
            warn!("Gateway hub is gone, dropping command");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::connection_located_channel;
    use crate::registry::ConnectionRegistry;
    use alertcast_sdk::objects::NotificationFrame;
    use serde_json::json;

    fn start() -> (GatewayHandle, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, _task) = GatewayHandle::spawn(Hub::new(ConnectionRegistry::new("india")), shutdown_rx);
        (handle, shutdown_tx)
    }

    fn payload(user: &str, location: Option<serde_json::Value>) -> RegisterPayload {
        RegisterPayload {
            user_id: Some(user.to_owned()),
            location,
        }
    }

    fn note(text: &str) -> Arc<ServerEvent> {
        Arc::new(ServerEvent::SystemNotification(NotificationFrame {
            notification: json!({"message": text}),
            attributes: Default::default(),
        }))
    }

    fn drain(rx: &mut OutboundReceiver) -> Vec<Arc<ServerEvent>> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_register_acks_success() {
        let (gateway, _shutdown) = start();
        let (id, mut rx) = gateway.connect().await.unwrap();

        let reg = gateway.register(id, payload("u1", None)).await.unwrap();
        assert_eq!(reg.connection.user_id, "u1");

        let event = rx.recv().await.unwrap();
        let ServerEvent::Registered(ack) = event.as_ref() else {
            panic!("expected registered, got {}", event.name());
        };
        assert!(ack.success);
        assert_eq!(ack.user_id.as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn test_register_without_user_id_acks_failure() {
        let (gateway, _shutdown) = start();
        let (id, mut rx) = gateway.connect().await.unwrap();

        let err = gateway.register(id, RegisterPayload::default()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Registry(RegistryError::MissingUserId)));

        let event = rx.recv().await.unwrap();
        let ServerEvent::Registered(ack) = event.as_ref() else {
            panic!("expected registered");
        };
        assert!(!ack.success);
        assert_eq!(ack.message, "User ID is required");

        // The connection stays usable for a retry.
        assert!(gateway.register(id, payload("u1", None)).await.is_ok());
    }

    #[tokio::test]
    async fn test_register_unknown_connection() {
        let (gateway, _shutdown) = start();
        let err = gateway
            .register(ConnectionId::new(), payload("u1", None))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Registry(RegistryError::NotConnected(_))));
    }

    #[tokio::test]
    async fn test_send_to_user_reaches_every_device() {
        let (gateway, _shutdown) = start();
        let (phone, mut phone_rx) = gateway.connect().await.unwrap();
        let (laptop, mut laptop_rx) = gateway.connect().await.unwrap();
        gateway.register(phone, payload("u1", None)).await.unwrap();
        gateway.register(laptop, payload("u1", None)).await.unwrap();
        drain(&mut phone_rx);
        drain(&mut laptop_rx);

        gateway.send_to(Target::User("u1".into()), note("hi")).await;
        gateway.disconnect(phone).await;
        gateway.send_to(Target::User("u1".into()), note("still here")).await;
        // Round-trip through the hub so every command above is applied.
        gateway.stats().await.unwrap();

        assert_eq!(drain(&mut phone_rx).len(), 1);
        assert_eq!(drain(&mut laptop_rx).len(), 2);
    }

    #[tokio::test]
    async fn test_channel_broadcast_deduplicates_members() {
        let (gateway, _shutdown) = start();
        let (mumbai, mut mumbai_rx) = gateway.connect().await.unwrap();
        let (pune, mut pune_rx) = gateway.connect().await.unwrap();
        let (_idle, mut idle_rx) = gateway.connect().await.unwrap();
        gateway
            .register(mumbai, payload("u1", Some(json!({"lat": 19.0, "lng": 72.8, "city": "Mumbai", "state": "Maharashtra"}))))
            .await
            .unwrap();
        gateway
            .register(pune, payload("u2", Some(json!({"lat": 18.5, "lng": 73.8, "city": "Pune", "state": "Maharashtra"}))))
            .await
            .unwrap();
        drain(&mut mumbai_rx);
        drain(&mut pune_rx);

        let channels = vec![
            Channel::country("india").unwrap(),
            Channel::state("maharashtra").unwrap(),
            Channel::city("mumbai").unwrap(),
            Channel::city("nowhere").unwrap(),
        ];
        gateway.broadcast_to_channels(channels, note("flood")).await;
        gateway.stats().await.unwrap();

        assert_eq!(drain(&mut mumbai_rx).len(), 1);
        assert_eq!(drain(&mut pune_rx).len(), 1);
        assert!(drain(&mut idle_rx).is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_all_includes_unregistered() {
        let (gateway, _shutdown) = start();
        let (_a, mut a_rx) = gateway.connect().await.unwrap();
        let (b, mut b_rx) = gateway.connect().await.unwrap();
        gateway.register(b, payload("u2", None)).await.unwrap();
        drain(&mut b_rx);

        gateway.broadcast_to_all(note("maintenance")).await;
        gateway.stats().await.unwrap();

        assert_eq!(drain(&mut a_rx).len(), 1);
        assert_eq!(drain(&mut b_rx).len(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking_others() {
        let (gateway, _shutdown) = start();
        let (_slow, _slow_rx) = gateway.connect().await.unwrap();
        let (_fast, mut fast_rx) = gateway.connect().await.unwrap();

        for i in 0..OUTBOUND_BUFFER + 5 {
            gateway.broadcast_to_all(note(&i.to_string())).await;
        }
        let stats = gateway.stats().await.unwrap();

        // Both queues hold OUTBOUND_BUFFER frames; the overflow was dropped.
        assert_eq!(stats.frames_dropped, 10);
        assert_eq!(drain(&mut fast_rx).len(), OUTBOUND_BUFFER);
    }

    #[tokio::test]
    async fn test_located_registration_emits_event() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (located_tx, mut located_rx) = connection_located_channel();
        let hub = Hub::new(ConnectionRegistry::new("india")).with_located_sender(located_tx);
        let (gateway, task) = GatewayHandle::spawn(hub, shutdown_rx);

        let (a, _a_rx) = gateway.connect().await.unwrap();
        let (b, _b_rx) = gateway.connect().await.unwrap();
        gateway.register(a, payload("u1", None)).await.unwrap();
        gateway
            .register(b, payload("u2", Some(json!({"coordinates": [72.88, 19.08]}))))
            .await
            .unwrap();

        let event = located_rx.recv().await.unwrap();
        assert_eq!(event.connection.user_id, "u2");
        assert!(located_rx.try_recv().is_err());

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        assert!(matches!(gateway.stats().await, Err(GatewayError::HubClosed)));
    }
    #[tokio::test]
    async fn test_stalled_matcher_does_not_block_registrations() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (located_tx, mut located_rx) = tokio::sync::mpsc::channel(1);
        let hub = Hub::new(ConnectionRegistry::new("india")).with_located_sender(located_tx);
        let (gateway, _task) = GatewayHandle::spawn(hub, shutdown_rx);

        let mut sessions = Vec::new();
        for user in ["u1", "u2", "u3"] {
            let (id, rx) = gateway.connect().await.unwrap();
            gateway
                .register(id, payload(user, Some(json!({"latitude": 19.07, "longitude": 72.87}))))
                .await
                .unwrap();
            sessions.push(rx);
        }
        for rx in &mut sessions {
            assert_eq!(drain(rx)[0].name(), "registered");
        }
        assert_eq!(gateway.stats().await.unwrap().registry.connections, 3);

        // Only the first event fit; the rest were skipped.
        assert_eq!(located_rx.recv().await.unwrap().connection.user_id, "u1");
        assert!(located_rx.try_recv().is_err());
    }
}
