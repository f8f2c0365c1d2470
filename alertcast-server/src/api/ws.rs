use std::time::Duration;

use alertcast_core::gateway::{GatewayError, GatewayHandle, Target};
use alertcast_core::registry::ConnectionId;
use alertcast_sdk::objects::{ClientEvent, ClientFrame, RegisteredAck, ServerEvent};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;

use crate::state::AppState;

/// How long queued frames may take to flush after the client side ended.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// `GET /ws`: realtime alert stream.
///
/// Upgrades the HTTP connection to a WebSocket, opens a hub session for it
/// and relays the session's outbound queue as JSON text frames until either
/// side closes.
pub(super) async fn gateway_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Drives a single WebSocket connection.
///
/// 1. Opens a hub session (`Connected`).
/// 2. Spawns a writer that drains the session queue into the socket.
/// 3. Reads client frames; `register` moves the session to `Registered`.
/// 4. On close, error or shutdown, unregisters the session (`Disconnected`).
async fn handle_socket(socket: WebSocket, state: AppState) {
    let gateway = state.gateway;
    let mut shutdown_rx = state.shutdown_rx;

    let (id, mut outbound) = match gateway.connect().await {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(error = %e, "WS: gateway unavailable, dropping connection");
            return;
        }
    };
    tracing::info!(connection = %id, "Client connected");

    let (mut sink, mut stream) = socket.split();

    // --- Writer: session queue -> socket ----------------------------------
    let mut writer = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let json = match serde_json::to_string(event.as_ref()) {
                Ok(json) => json,
                Err(e) => {
                    tracing::warn!(connection = %id, event = event.name(), error = %e, "WS: failed to encode frame");
                    continue;
                }
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                return;
            }
        }
        // The hub dropped the queue: the session is over.
        let _ = sink.send(Message::Close(None)).await;
    });

    // --- Reader: socket -> gateway ----------------------------------------
    let mut writer_done = false;
    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }

            _ = &mut writer => {
                writer_done = true;
                break;
            }

            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if !on_client_frame(&gateway, id, text.as_str()).await {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(connection = %id, error = %e, "WS: receive failed");
                    break;
                }
            }
        }
    }

    gateway.disconnect(id).await;
    if !writer_done {
        let _ = tokio::time::timeout(FLUSH_TIMEOUT, writer).await;
    }
    tracing::info!(connection = %id, "Client disconnected");
}

/// Handle one text frame. Returns `false` if the client asked to disconnect.
async fn on_client_frame(gateway: &GatewayHandle, id: ConnectionId, text: &str) -> bool {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(connection = %id, error = %e, "WS: ignoring malformed frame");
            return true;
        }
    };

    match ClientEvent::from_frame(frame) {
        Ok(ClientEvent::Register(payload)) => match gateway.register(id, payload).await {
            Ok(registration) => {
                if let Some(e) = registration.location_error {
                    tracing::debug!(connection = %id, error = %e, "Registered without a usable location");
                }
            }
            Err(GatewayError::Registry(e)) => {
                tracing::debug!(connection = %id, error = %e, "Registration rejected");
            }
            Err(e) => {
                tracing::warn!(connection = %id, error = %e, "Registration failed");
            }
        },
        Ok(ClientEvent::Disconnect) => return false,
        Ok(ClientEvent::Unknown(event)) => {
            tracing::debug!(connection = %id, %event, "WS: ignoring unknown event");
        }
        Err(e) => {
            tracing::debug!(connection = %id, error = %e, "WS: invalid registration payload");
            let ack = ServerEvent::Registered(RegisteredAck::rejected("Invalid registration data"));
            gateway.send_to(Target::Connection(id), Arc::new(ack)).await;
        }
    }
    true
}
