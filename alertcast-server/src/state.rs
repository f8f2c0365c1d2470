//! Application state shared across all request handlers.

use alertcast_core::bus::MessageBus;
use alertcast_core::gateway::GatewayHandle;
use tokio::sync::watch;

/// Application state that is shared across all request handlers.
///
/// This is cloneable and cheap to pass around (every field is a handle).
#[derive(Clone)]
pub struct AppState {
    /// Handle to the hub owning every live connection.
    pub gateway: GatewayHandle,
    /// Message bus, for `/stats`.
    pub bus: MessageBus,
    /// Flips to `true` once the process is shutting down. WebSocket tasks
    /// outlive the HTTP server's graceful shutdown and watch this instead.
    pub shutdown_rx: watch::Receiver<bool>,
}

impl AppState {
    pub fn new(gateway: GatewayHandle, bus: MessageBus, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            gateway,
            bus,
            shutdown_rx,
        }
    }
}
