use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use alertcast_sdk::objects::{RegisterPayload, RegisteredAck, ServerEvent};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::{HubStats, Target};
use crate::events::{ConnectionLocated, ConnectionLocatedSender};
use crate::registry::{Channel, Connection, ConnectionId, ConnectionRegistry, Registration, RegistryError};

pub(super) type Outbound = mpsc::Sender<Arc<ServerEvent>>;

/// Requests accepted by the hub task.
pub(super) enum HubCommand {
    Connect {
        id: ConnectionId,
        outbound: Outbound,
    },
    Register {
        id: ConnectionId,
        payload: RegisterPayload,
        reply: oneshot::Sender<Result<Registration, RegistryError>>,
    },
    Disconnect {
        id: ConnectionId,
    },
    SendTo {
        target: Target,
        event: Arc<ServerEvent>,
    },
    Broadcast {
        channels: Vec<Channel>,
        event: Arc<ServerEvent>,
    },
    BroadcastAll {
        event: Arc<ServerEvent>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<Arc<Connection>>>,
    },
    Stats {
        reply: oneshot::Sender<HubStats>,
    },
}

/// Why a single frame was not handed to a connection. Logged, never
/// surfaced to whoever asked for the send.
#[derive(Debug, Error)]
enum DeliveryFailure {
    #[error("no open connection for {0}")]
    UnknownTarget(String),

    #[error("outbound queue of {0} is full")]
    QueueFull(ConnectionId),

    #[error("connection {0} already closed")]
    Closed(ConnectionId),
}

/// Owns the registry and every connection's outbound queue.
///
/// All registry mutations and all sends go through this one task, so
/// registration, removal and fan-out never race each other.
pub struct Hub {
    registry: ConnectionRegistry,
    sessions: HashMap<ConnectionId, Outbound>,
    located_tx: Option<ConnectionLocatedSender>,
    frames_dropped: u64,
}

impl Hub {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self {
            registry,
            sessions: HashMap::new(),
            located_tx: None,
            frames_dropped: 0,
        }
    }

    /// Emit a [`ConnectionLocated`] event whenever a registration carries a
    /// usable location.
    pub fn with_located_sender(mut self, tx: ConnectionLocatedSender) -> Self {
        self.located_tx = Some(tx);
        self
    }

    pub(super) async fn run(
        mut self,
        mut shutdown_rx: watch::Receiver<bool>,
        mut command_rx: mpsc::Receiver<HubCommand>,
    ) {
        info!("Gateway hub started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway hub received shutdown signal");
                        break;
                    }
                }

                Some(command) = command_rx.recv() => {
                    self.handle(command).await;
                }

                else => {
                    info!("All gateway handles dropped");
                    break;
                }
            }
        }

        // Dropping the senders ends every connection's send task.
        self.sessions.clear();
        info!(
            frames_dropped = self.frames_dropped,
            "Gateway hub shutdown complete"
        );
    }

    async fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Connect { id, outbound } => {
                debug!(connection = %id, "Connection opened");
                self.sessions.insert(id, outbound);
            }
            HubCommand::Register { id, payload, reply } => {
                let result = self.register(id, &payload);
                let _ = reply.send(result);
            }
            HubCommand::Disconnect { id } => {
                self.sessions.remove(&id);
                if let Some(connection) = self.registry.unregister(id) {
                    info!(connection = %id, user_id = %connection.user_id, "User disconnected");
                } else {
                    debug!(connection = %id, "Unregistered connection closed");
                }
            }
            HubCommand::SendTo { target, event } => {
                let ids: Vec<ConnectionId> = match &target {
                    Target::Connection(id) => vec![*id],
                    Target::User(user_id) => self.registry.lookup(user_id).collect(),
                };
                if ids.is_empty() {
                    self.log_failure(
                        event.name(),
                        DeliveryFailure::UnknownTarget(target.to_string()),
                    );
                }
                for id in ids {
                    self.deliver(id, &event);
                }
            }
            HubCommand::Broadcast { channels, event } => {
                // Union, so a connection in several channels gets one copy.
                let members: HashSet<ConnectionId> = channels
                    .iter()
                    .flat_map(|c| self.registry.members(c))
                    .collect();
                debug!(
                    event = event.name(),
                    channels = channels.len(),
                    recipients = members.len(),
                    "Broadcasting to channels"
                );
                for id in members {
                    self.deliver(id, &event);
                }
            }
            HubCommand::BroadcastAll { event } => {
                let ids: Vec<ConnectionId> = self.sessions.keys().copied().collect();
                debug!(event = event.name(), recipients = ids.len(), "Broadcasting to all");
                for id in ids {
                    self.deliver(id, &event);
                }
            }
            HubCommand::Snapshot { reply } => {
                let _ = reply.send(self.registry.snapshot());
            }
            HubCommand::Stats { reply } => {
                let _ = reply.send(HubStats {
                    open_connections: self.sessions.len(),
                    registry: self.registry.stats(),
                    frames_dropped: self.frames_dropped,
                });
            }
        }
    }

    fn register(
        &mut self,
        id: ConnectionId,
        payload: &RegisterPayload,
    ) -> Result<Registration, RegistryError> {
        if !self.sessions.contains_key(&id) {
            return Err(RegistryError::NotConnected(id));
        }

        let registration = match self.registry.register(id, payload) {
            Ok(registration) => registration,
            Err(e) => {
                warn!(connection = %id, error = %e, "Registration rejected");
                self.deliver(id, &Arc::new(ServerEvent::Registered(RegisteredAck::rejected(e.to_string()))));
                return Err(e);
            }
        };

        let connection = &registration.connection;
        if let Some(e) = &registration.location_error {
            warn!(connection = %id, user_id = %connection.user_id, error = %e, "Ignoring unusable location");
        }
        info!(
            connection = %id,
            user_id = %connection.user_id,
            channels = connection.channels.len(),
            located = connection.location.is_some(),
            "User registered"
        );

        let ack = ServerEvent::Registered(RegisteredAck::accepted(connection.user_id.as_str()));
        self.deliver(id, &Arc::new(ack));

        if connection.location.is_some() {
            if let Some(tx) = &self.located_tx {
                let event = ConnectionLocated {
                    connection: Arc::clone(connection),
                };
                match tx.try_send(event) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(connection = %id, "Matcher is behind, skipping on-demand update");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        warn!(connection = %id, "Failed to send ConnectionLocated, receiver dropped");
                    }
                }
            }
        }

        Ok(registration)
    }

    /// Best-effort hand-off to one connection's outbound queue.
    fn deliver(&mut self, id: ConnectionId, event: &Arc<ServerEvent>) {
        let Some(outbound) = self.sessions.get(&id) else {
            self.log_failure(event.name(), DeliveryFailure::UnknownTarget(id.to_string()));
            return;
        };
        match outbound.try_send(Arc::clone(event)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.log_failure(event.name(), DeliveryFailure::QueueFull(id));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.log_failure(event.name(), DeliveryFailure::Closed(id));
            }
        }
    }

    fn log_failure(&mut self, event: &'static str, failure: DeliveryFailure) {
        self.frames_dropped += 1;
        debug!(event, error = %failure, "Frame not delivered");
    }
}
