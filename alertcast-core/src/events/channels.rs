//! Event channel factories and handles.

use super::types::ConnectionLocated;
use tokio::sync::mpsc;

/// Default buffer size for event and command channels.
///
/// Enough to absorb bursts while keeping memory bounded.
pub const DEFAULT_CHANNEL_BUFFER: usize = 256;

/// Sender handle for ConnectionLocated events.
pub type ConnectionLocatedSender = mpsc::Sender<ConnectionLocated>;
/// Receiver handle for ConnectionLocated events.
pub type ConnectionLocatedReceiver = mpsc::Receiver<ConnectionLocated>;

/// Create a new ConnectionLocated channel.
///
/// The sender goes to the gateway hub, the receiver to the matcher.
pub fn connection_located_channel() -> (ConnectionLocatedSender, ConnectionLocatedReceiver) {
    mpsc::channel(DEFAULT_CHANNEL_BUFFER)
}
