use std::fmt;
use std::time::Duration;

/// Which message backbone the bus adapter talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackboneKind {
    /// NATS JetStream.
    Nats,
    /// In-process queues, for single-node deployments and tests.
    Memory,
    /// No backbone: publishes are acknowledged locally and subscriptions
    /// never deliver.
    Disabled,
}

impl fmt::Display for BackboneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackboneKind::Nats => "nats",
            BackboneKind::Memory => "memory",
            BackboneKind::Disabled => "none",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BusConfig {
    pub backbone: BackboneKind,
    /// NATS server URL(s), comma separated.
    pub url: String,
    /// Prefix for JetStream stream names and subjects.
    pub stream_prefix: String,
    pub connect_timeout: Duration,
    /// How long a delivery may stay unacknowledged before redelivery.
    pub ack_wait: Duration,
    /// Total delivery attempts per message, including the first.
    /// Non-positive means unlimited.
    pub max_deliver: i64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backbone: BackboneKind::Nats,
            url: "nats://127.0.0.1:4222".to_owned(),
            stream_prefix: "alertcast".to_owned(),
            connect_timeout: Duration::from_secs(5),
            ack_wait: Duration::from_secs(60),
            max_deliver: 5,
        }
    }
}
