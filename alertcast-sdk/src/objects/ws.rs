//! WebSocket frames exchanged on `GET /ws`.
//!
//! Every frame, in both directions, is a JSON object of the form
//!
//! ```json
//! {"event":"disaster-warning","data":{ ... }}
//! ```
//!
//! # Protocol
//!
//! 1. The client sends `register` (or its alias `register_user`) with
//!    `{"userId": "...", "location": {...}}`. `data` may also be a string
//!    holding the same object JSON-encoded.
//! 2. The server answers with `registered`. A failed registration leaves the
//!    connection open so the client can retry.
//! 3. If the registration carried a usable location, the server follows up
//!    with `active-disasters` and one framed message per nearby alert.
//! 4. From then on the server pushes alert frames as they are routed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::alert::Attributes;

/// Distance annotation attached to personalised deliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proximity {
    /// Great-circle distance to the alert center, rounded to whole meters.
    pub distance_meters: u64,
    /// The same distance in kilometers with two decimals, for display.
    pub distance_km: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personal_message: Option<String>,
}

impl Proximity {
    pub fn new(distance_meters: f64) -> Self {
        let meters = distance_meters.max(0.0).round() as u64;
        Self {
            distance_meters: meters,
            distance_km: format!("{:.2}", distance_meters / 1000.0),
            personal_message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.personal_message = Some(message.into());
        self
    }
}

/// Payload of `emergency-alert` and `critical-alert`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertFrame {
    pub alert: Value,
    pub attributes: Attributes,
    #[serde(flatten)]
    pub proximity: Option<Proximity>,
}

/// Payload of `disaster-warning`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarningFrame {
    pub warning: Value,
    pub attributes: Attributes,
    #[serde(flatten)]
    pub proximity: Option<Proximity>,
}

/// Payload of `evacuation-notice` and `critical-evacuation`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoticeFrame {
    pub notice: Value,
    pub attributes: Attributes,
    #[serde(flatten)]
    pub proximity: Option<Proximity>,
}

/// Payload of `system-notification`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationFrame {
    pub notification: Value,
    pub attributes: Attributes,
}

/// Reply to a `register` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredAck {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl RegisteredAck {
    pub fn accepted(user_id: impl Into<String>) -> Self {
        Self {
            success: true,
            message: "Successfully registered for real-time updates".to_owned(),
            user_id: Some(user_id.into()),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            user_id: None,
        }
    }
}

/// Summary sent once after a located registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveDisasters {
    pub count: usize,
    pub message: String,
    pub disasters: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Server-to-client frame.
///
/// Serialized adjacently tagged so the client can dispatch on `"event"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    Registered(RegisteredAck),
    EmergencyAlert(AlertFrame),
    DisasterWarning(WarningFrame),
    EvacuationNotice(NoticeFrame),
    SystemNotification(NotificationFrame),
    /// Global fan-out variant of `emergency-alert` for critical severity.
    CriticalAlert(AlertFrame),
    /// Global fan-out variant of `evacuation-notice` for critical severity.
    CriticalEvacuation(NoticeFrame),
    ActiveDisasters(ActiveDisasters),
}

impl ServerEvent {
    /// The wire event name.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Registered(_) => "registered",
            ServerEvent::EmergencyAlert(_) => "emergency-alert",
            ServerEvent::DisasterWarning(_) => "disaster-warning",
            ServerEvent::EvacuationNotice(_) => "evacuation-notice",
            ServerEvent::SystemNotification(_) => "system-notification",
            ServerEvent::CriticalAlert(_) => "critical-alert",
            ServerEvent::CriticalEvacuation(_) => "critical-evacuation",
            ServerEvent::ActiveDisasters(_) => "active-disasters",
        }
    }

    /// Distance annotation, if this is a personalised delivery.
    pub fn proximity(&self) -> Option<&Proximity> {
        match self {
            ServerEvent::EmergencyAlert(f) | ServerEvent::CriticalAlert(f) => f.proximity.as_ref(),
            ServerEvent::DisasterWarning(f) => f.proximity.as_ref(),
            ServerEvent::EvacuationNotice(f) | ServerEvent::CriticalEvacuation(f) => {
                f.proximity.as_ref()
            }
            _ => None,
        }
    }
}

/// Raw client-to-server frame as it arrives on the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl ClientFrame {
    pub const REGISTER: &'static str = "register";
    pub const REGISTER_USER: &'static str = "register_user";
    pub const DISCONNECT: &'static str = "disconnect";

    /// Build a `register` frame.
    pub fn register(user_id: impl Into<String>, location: Option<Value>) -> Self {
        let mut data = serde_json::Map::new();
        data.insert("userId".to_owned(), Value::String(user_id.into()));
        if let Some(location) = location {
            data.insert("location".to_owned(), location);
        }
        Self {
            event: Self::REGISTER.to_owned(),
            data: Value::Object(data),
        }
    }
}

/// Registration request after edge decoding.
///
/// `user_id` stays optional here; rejecting a missing id is the registry's
/// decision, not the protocol's.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegisterPayload {
    pub user_id: Option<String>,
    /// Location in whatever shape the client sent it.
    pub location: Option<Value>,
}

/// Errors raised while decoding client frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("registration payload must be an object")]
    NotAnObject,
}

/// Client event after translating the wire name once, at the edge.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// `register` or `register_user`.
    Register(RegisterPayload),
    /// Transport-level close.
    Disconnect,
    /// Any other event name; ignored by the gateway.
    Unknown(String),
}

impl ClientEvent {
    /// Parse a text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let frame: ClientFrame = serde_json::from_str(text)?;
        Self::from_frame(frame)
    }

    pub fn from_frame(frame: ClientFrame) -> Result<Self, ProtocolError> {
        match frame.event.as_str() {
            ClientFrame::REGISTER | ClientFrame::REGISTER_USER => {
                decode_register(frame.data).map(ClientEvent::Register)
            }
            ClientFrame::DISCONNECT => Ok(ClientEvent::Disconnect),
            _ => Ok(ClientEvent::Unknown(frame.event)),
        }
    }
}

fn decode_register(data: Value) -> Result<RegisterPayload, ProtocolError> {
    // Some clients send the payload JSON-encoded inside a string.
    let data = match data {
        Value::String(encoded) => serde_json::from_str(&encoded)?,
        other => other,
    };
    let Value::Object(mut map) = data else {
        return Err(ProtocolError::NotAnObject);
    };

    let user_id = match map.remove("userId") {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    let location = map.remove("location").filter(|v| !v.is_null());

    Ok(RegisterPayload { user_id, location })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_aliases() {
        let a = ClientEvent::parse(r#"{"event":"register","data":{"userId":"u1"}}"#).unwrap();
        let b = ClientEvent::parse(r#"{"event":"register_user","data":{"userId":"u1"}}"#).unwrap();
        assert_eq!(a, b);
        assert!(matches!(a, ClientEvent::Register(RegisterPayload { user_id: Some(ref id), .. }) if id == "u1"));
    }

    #[test]
    fn test_register_accepts_string_encoded_payload() {
        let frame = json!({
            "event": "register",
            "data": "{\"userId\":\"u2\",\"location\":{\"latitude\":1.0,\"longitude\":2.0}}"
        });
        let event = ClientEvent::parse(&frame.to_string()).unwrap();
        let ClientEvent::Register(payload) = event else {
            panic!("expected register");
        };
        assert_eq!(payload.user_id.as_deref(), Some("u2"));
        assert_eq!(payload.location, Some(json!({"latitude": 1.0, "longitude": 2.0})));
    }

    #[test]
    fn test_numeric_user_id_and_missing_user_id() {
        let ClientEvent::Register(p) =
            ClientEvent::parse(r#"{"event":"register","data":{"userId":42}}"#).unwrap()
        else {
            panic!("expected register");
        };
        assert_eq!(p.user_id.as_deref(), Some("42"));

        let ClientEvent::Register(p) =
            ClientEvent::parse(r#"{"event":"register","data":{}}"#).unwrap()
        else {
            panic!("expected register");
        };
        assert_eq!(p.user_id, None);
    }

    #[test]
    fn test_non_object_register_payload_is_rejected() {
        assert!(matches!(
            ClientEvent::parse(r#"{"event":"register","data":[1,2]}"#),
            Err(ProtocolError::NotAnObject)
        ));
    }

    #[test]
    fn test_unknown_event_is_preserved() {
        assert_eq!(
            ClientEvent::parse(r#"{"event":"ping"}"#).unwrap(),
            ClientEvent::Unknown("ping".to_owned())
        );
    }

    #[test]
    fn test_server_event_wire_shape() {
        let event = ServerEvent::DisasterWarning(WarningFrame {
            warning: json!({"id": "disaster-1"}),
            attributes: Attributes::from([("severity".to_owned(), "high".to_owned())]),
            proximity: Some(Proximity::new(4_612.4).with_message("near")),
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "disaster-warning");
        assert_eq!(value["data"]["distanceMeters"], 4612);
        assert_eq!(value["data"]["distanceKm"], "4.61");
        assert_eq!(value["data"]["personalMessage"], "near");
        assert_eq!(event.name(), "disaster-warning");
    }

    #[test]
    fn test_frame_without_proximity_omits_distance() {
        let event = ServerEvent::EmergencyAlert(AlertFrame {
            alert: json!({}),
            attributes: Attributes::new(),
            proximity: None,
        });
        let value = serde_json::to_value(&event).unwrap();
        assert!(value["data"].get("distanceMeters").is_none());
    }
}
