//! Shared wire types for alertcast.
//!
//! Everything a WebSocket client or an alert producer needs to talk to the
//! gateway lives here: alert documents, message-bus attribute conventions,
//! and the JSON frames exchanged over `/ws`. The optional `client` feature
//! adds a small tokio-tungstenite based client.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(unsafe_code)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

#[cfg(feature = "client")]
pub mod client;
pub mod objects;
