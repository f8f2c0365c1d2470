//! Events passed between the bus, the gateway hub and the processors.
//!
//! # Event Flow
//!
//! 1. Bus subscription -> `BusAlert` -> `NotificationRouter` -> gateway
//! 2. Gateway hub -> `ConnectionLocated` -> `GeoAlertMatcher` -> gateway
//! 3. Periodic tick -> `GeoAlertMatcher` scan -> gateway

pub mod channels;
pub mod types;

pub use channels::{
    ConnectionLocatedReceiver, ConnectionLocatedSender, DEFAULT_CHANNEL_BUFFER,
    connection_located_channel,
};

pub use types::{BusAlert, ConnectionLocated};
