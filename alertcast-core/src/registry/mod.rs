//! Connection registry.
//!
//! Tracks every registered connection together with its user id, location
//! and channel memberships. One user may hold several connections (phone and
//! browser, say); each is tracked on its own and removing one leaves the
//! others deliverable.
//!
//! The registry is plain data with `&mut self` mutators. It is owned by the
//! gateway hub task, which serializes every mutation, so no locking happens
//! here. Readers outside the hub get a [`snapshot`](ConnectionRegistry::snapshot)
//! of `Arc<Connection>` values that stays valid while the registry changes.

mod channel;

pub use channel::Channel;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use alertcast_sdk::objects::{GeoPoint, RegisterPayload};
use compact_str::CompactString;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::geo::{LocationError, Place, normalize_location};

/// Identifies one transport connection. Time-ordered (UUIDv7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A registered connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    pub id: ConnectionId,
    pub user_id: CompactString,
    /// `None` when the client sent no location or an unusable one.
    pub location: Option<GeoPoint>,
    pub place: Place,
    pub channels: Vec<Channel>,
    pub registered_at: OffsetDateTime,
}

/// Result of a successful [`register`](ConnectionRegistry::register).
#[derive(Debug, Clone)]
pub struct Registration {
    pub connection: Arc<Connection>,
    /// Set when a location was supplied but could not be normalized. The
    /// registration itself still succeeded.
    pub location_error: Option<LocationError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("User ID is required")]
    MissingUserId,

    #[error("connection {0} is not open")]
    NotConnected(ConnectionId),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub connections: usize,
    pub users: usize,
    pub channels: usize,
}

pub struct ConnectionRegistry {
    country: Option<Channel>,
    connections: HashMap<ConnectionId, Arc<Connection>>,
    by_user: HashMap<CompactString, HashSet<ConnectionId>>,
    channels: HashMap<Channel, HashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    /// `country` is the channel every located connection joins.
    pub fn new(country: &str) -> Self {
        Self {
            country: Channel::country(country),
            connections: HashMap::new(),
            by_user: HashMap::new(),
            channels: HashMap::new(),
        }
    }

    /// Register (or re-register) a connection.
    ///
    /// A missing user id is rejected. A location that cannot be normalized
    /// does not fail the registration; the connection joins its user channel
    /// and any city/state channels it named, and the error is reported in
    /// [`Registration::location_error`].
    pub fn register(
        &mut self,
        id: ConnectionId,
        payload: &RegisterPayload,
    ) -> Result<Registration, RegistryError> {
        let user_id = payload
            .user_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(RegistryError::MissingUserId)?;

        // Re-registration replaces the previous record and memberships.
        self.unregister(id);

        let (location, place, location_error) = match &payload.location {
            Some(raw) => {
                let place = Place::from_raw(raw);
                match normalize_location(raw) {
                    Ok(point) => (Some(point), place, None),
                    Err(e) => (None, place, Some(e)),
                }
            }
            None => (None, Place::default(), None),
        };

        let mut channels = vec![Channel::user(user_id)];
        if payload.location.is_some() {
            channels.extend(self.country.clone());
            channels.extend(place.state.as_deref().and_then(Channel::state));
            channels.extend(place.city.as_deref().and_then(Channel::city));
        }

        let connection = Arc::new(Connection {
            id,
            user_id: CompactString::from(user_id),
            location,
            place,
            channels,
            registered_at: OffsetDateTime::now_utc(),
        });

        for channel in &connection.channels {
            self.channels.entry(channel.clone()).or_default().insert(id);
        }
        self.by_user
            .entry(connection.user_id.clone())
            .or_default()
            .insert(id);
        self.connections.insert(id, Arc::clone(&connection));

        Ok(Registration {
            connection,
            location_error,
        })
    }

    /// Remove a connection. Unknown ids are a no-op.
    pub fn unregister(&mut self, id: ConnectionId) -> Option<Arc<Connection>> {
        let connection = self.connections.remove(&id)?;

        if let Some(ids) = self.by_user.get_mut(&connection.user_id) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_user.remove(&connection.user_id);
            }
        }
        for channel in &connection.channels {
            if let Some(members) = self.channels.get_mut(channel) {
                members.remove(&id);
                if members.is_empty() {
                    self.channels.remove(channel);
                }
            }
        }

        Some(connection)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Arc<Connection>> {
        self.connections.get(&id)
    }

    /// Channels the connection joined at registration.
    pub fn channels_for(&self, id: ConnectionId) -> Option<&[Channel]> {
        self.connections.get(&id).map(|c| c.channels.as_slice())
    }

    /// All live connections of a user.
    pub fn lookup(&self, user_id: &str) -> impl Iterator<Item = ConnectionId> + '_ {
        self.by_user.get(user_id).into_iter().flatten().copied()
    }

    /// Current members of a channel. Unknown channels have none.
    pub fn members(&self, channel: &Channel) -> impl Iterator<Item = ConnectionId> + '_ {
        self.channels.get(channel).into_iter().flatten().copied()
    }

    /// Point-in-time copy of every registered connection.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            connections: self.connections.len(),
            users: self.by_user.len(),
            channels: self.channels.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(user: &str, location: Option<serde_json::Value>) -> RegisterPayload {
        RegisterPayload {
            user_id: Some(user.to_owned()),
            location,
        }
    }

    fn channel_keys(conn: &Connection) -> Vec<String> {
        conn.channels.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_register_with_full_location() {
        let mut registry = ConnectionRegistry::new("India");
        let id = ConnectionId::new();
        let reg = registry
            .register(
                id,
                &payload(
                    "u1",
                    Some(json!({"latitude": 19.07, "longitude": 72.87, "city": "Mumbai", "state": "Maharashtra"})),
                ),
            )
            .unwrap();

        assert!(reg.location_error.is_none());
        assert_eq!(reg.connection.location, Some(GeoPoint::new(19.07, 72.87)));
        assert_eq!(
            channel_keys(&reg.connection),
            ["user:u1", "country:india", "state:maharashtra", "city:mumbai"]
        );
        assert_eq!(
            registry.members(&Channel::city("mumbai").unwrap()).collect::<Vec<_>>(),
            vec![id]
        );
    }

    #[test]
    fn test_missing_user_id_is_rejected() {
        let mut registry = ConnectionRegistry::new("india");
        let err = registry
            .register(ConnectionId::new(), &RegisterPayload::default())
            .unwrap_err();
        assert_eq!(err, RegistryError::MissingUserId);
        assert_eq!(err.to_string(), "User ID is required");

        let blank = payload("   ", None);
        assert!(registry.register(ConnectionId::new(), &blank).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unusable_location_still_registers() {
        let mut registry = ConnectionRegistry::new("india");
        let reg = registry
            .register(ConnectionId::new(), &payload("u1", Some(json!({"city": "Pune"}))))
            .unwrap();

        assert_eq!(reg.location_error, Some(LocationError::UnrecognizedShape));
        assert_eq!(reg.connection.location, None);
        assert_eq!(channel_keys(&reg.connection), ["user:u1", "country:india", "city:pune"]);
    }

    #[test]
    fn test_no_location_joins_only_user_channel() {
        let mut registry = ConnectionRegistry::new("india");
        let reg = registry
            .register(ConnectionId::new(), &payload("u1", None))
            .unwrap();
        assert_eq!(channel_keys(&reg.connection), ["user:u1"]);
        assert!(reg.location_error.is_none());
    }

    #[test]
    fn test_multi_device_unregister_keeps_other_connection() {
        let mut registry = ConnectionRegistry::new("india");
        let phone = ConnectionId::new();
        let laptop = ConnectionId::new();
        let loc = Some(json!({"coordinates": [72.88, 19.08], "city": "Mumbai"}));
        registry.register(phone, &payload("u1", loc.clone())).unwrap();
        registry.register(laptop, &payload("u1", loc)).unwrap();

        let mut ids: Vec<_> = registry.lookup("u1").collect();
        ids.sort();
        let mut expected = vec![phone, laptop];
        expected.sort();
        assert_eq!(ids, expected);

        let removed = registry.unregister(phone).unwrap();
        assert_eq!(removed.id, phone);
        assert_eq!(registry.lookup("u1").collect::<Vec<_>>(), vec![laptop]);
        assert_eq!(
            registry.members(&Channel::city("Mumbai").unwrap()).collect::<Vec<_>>(),
            vec![laptop]
        );

        registry.unregister(laptop);
        assert_eq!(registry.lookup("u1").count(), 0);
        assert_eq!(registry.stats(), RegistryStats::default());
    }

    #[test]
    fn test_unregister_unknown_is_noop() {
        let mut registry = ConnectionRegistry::new("india");
        assert!(registry.unregister(ConnectionId::new()).is_none());
    }

    #[test]
    fn test_channels_for_geojson_location() {
        let mut registry = ConnectionRegistry::new("india");
        let id = ConnectionId::new();
        registry
            .register(id, &payload("u1", Some(json!({"coordinates": [72.88, 19.08], "city": "Pune"}))))
            .unwrap();

        let keys: Vec<String> = registry
            .channels_for(id)
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(keys, ["user:u1", "country:india", "city:pune"]);
        assert_eq!(registry.get(id).unwrap().location, Some(GeoPoint::new(19.08, 72.88)));

        registry.unregister(id);
        assert!(registry.channels_for(id).is_none());
    }

    #[test]
    fn test_reregister_moves_channels() {
        let mut registry = ConnectionRegistry::new("india");
        let id = ConnectionId::new();
        registry
            .register(id, &payload("u1", Some(json!({"lat": 19.0, "lng": 72.8, "city": "Mumbai"}))))
            .unwrap();
        registry
            .register(id, &payload("u1", Some(json!({"lat": 18.5, "lng": 73.8, "city": "Pune"}))))
            .unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.members(&Channel::city("Mumbai").unwrap()).count(), 0);
        assert_eq!(registry.members(&Channel::city("Pune").unwrap()).count(), 1);
        assert_eq!(registry.get(id).unwrap().location, Some(GeoPoint::new(18.5, 73.8)));
    }

    #[test]
    fn test_snapshot_survives_mutation() {
        let mut registry = ConnectionRegistry::new("india");
        let id = ConnectionId::new();
        registry.register(id, &payload("u1", None)).unwrap();

        let snapshot = registry.snapshot();
        registry.unregister(id);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].user_id, "u1");
        assert!(registry.is_empty());
    }
}
