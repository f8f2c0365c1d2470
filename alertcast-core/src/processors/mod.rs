//! Event processors for the event-driven architecture.
//!
//! - `NotificationRouter`: Receives `BusAlert` from the message bus, fans it
//!   out to location channels through the gateway
//! - `GeoAlertMatcher`: Periodically matches active alerts against located
//!   connections; receives `ConnectionLocated` for on-demand updates

pub mod geo_matcher;
pub mod notification_router;

pub use geo_matcher::{
    GeoAlertMatcher, Match, ScanOutcome, ScanPhase, ScannedAlert, match_connections,
};
pub use notification_router::{NotificationRouter, RouteOutcome, RouterSubscription};
