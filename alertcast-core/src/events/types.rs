//! Event type definitions.
//!
//! Events are ephemeral. [`BusAlert`] carries the decoded message body as
//! it came off the bus; [`ConnectionLocated`] carries a snapshot of the
//! connection record, so the matcher never has to query the hub back.

use std::sync::Arc;

use alertcast_sdk::objects::{AlertKind, Attributes};
use serde_json::Value;

use crate::registry::Connection;

/// A decoded message taken from one of the alert subscriptions.
#[derive(Debug, Clone, PartialEq)]
pub struct BusAlert {
    pub kind: AlertKind,
    pub payload: Value,
    pub attributes: Attributes,
}

impl BusAlert {
    pub fn new(kind: AlertKind, payload: Value, attributes: Attributes) -> Self {
        Self {
            kind,
            payload,
            attributes,
        }
    }

    /// The payload's `id`, when it has a usable one.
    pub fn id(&self) -> Option<&str> {
        self.payload
            .get("id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// Emitted by the gateway hub when a registration carried a usable location.
///
/// Triggers the on-demand proximity check for that single connection.
#[derive(Debug, Clone)]
pub struct ConnectionLocated {
    pub connection: Arc<Connection>,
}
