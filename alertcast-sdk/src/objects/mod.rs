pub mod alert;
pub mod location;
pub mod ws;

pub use alert::{ActiveAlert, AlertKind, AlertLocation, Attributes, Severity, attribute};
pub use location::GeoPoint;
pub use ws::{
    ActiveDisasters, AlertFrame, ClientEvent, ClientFrame, NoticeFrame, NotificationFrame,
    ProtocolError, Proximity, RegisterPayload, RegisteredAck, ServerEvent, WarningFrame,
};
