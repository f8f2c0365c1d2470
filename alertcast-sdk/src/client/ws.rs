use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::ClientError;
use crate::objects::ws::{ClientFrame, ServerEvent};

/// Typed client for the gateway's `/ws` endpoint.
///
/// ```ignore
/// let mut client = AlertClient::connect(&"ws://127.0.0.1:8080/ws".parse()?).await?;
/// client.register("u1", Some(json!({"latitude": 19.07, "longitude": 72.87}))).await?;
/// while let Some(event) = client.next_event().await? {
///     println!("{}: {:?}", event.name(), event);
/// }
/// ```
pub struct AlertClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl AlertClient {
    /// Open a WebSocket connection to `url`.
    pub async fn connect(url: &Url) -> Result<Self, ClientError> {
        let (stream, _response) = connect_async(url.as_str()).await?;
        Ok(Self { stream })
    }

    /// Send a `register` frame.
    pub async fn register(
        &mut self,
        user_id: impl Into<String>,
        location: Option<Value>,
    ) -> Result<(), ClientError> {
        self.send_frame(&ClientFrame::register(user_id, location))
            .await
    }

    /// Send an arbitrary client frame.
    pub async fn send_frame(&mut self, frame: &ClientFrame) -> Result<(), ClientError> {
        let json = serde_json::to_string(frame)?;
        self.stream.send(Message::Text(json)).await?;
        Ok(())
    }

    /// Wait for the next server event.
    ///
    /// Control frames are handled transparently. Returns `Ok(None)` once the
    /// server closes the connection.
    pub async fn next_event(&mut self) -> Result<Option<ServerEvent>, ClientError> {
        while let Some(msg) = self.stream.next().await {
            match msg? {
                Message::Text(text) => return Ok(Some(serde_json::from_str(&text)?)),
                Message::Binary(_) => return Err(ClientError::UnexpectedBinary),
                Message::Close(_) => return Ok(None),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
        Ok(None)
    }

    /// Send a close frame and drain the connection.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.stream.close(None).await?;
        Ok(())
    }
}
