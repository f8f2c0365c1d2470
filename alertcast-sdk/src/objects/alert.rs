//! Alert documents and message-bus attribute conventions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::location::GeoPoint;

/// String attributes attached to every bus message.
///
/// A `BTreeMap` keeps the key order stable so serialized attributes are
/// deterministic.
pub type Attributes = BTreeMap<String, String>;

/// Well-known attribute keys.
pub mod attribute {
    pub const SEVERITY: &str = "severity";
    pub const TYPE: &str = "type";
    pub const REGION: &str = "region";
    pub const TIMESTAMP: &str = "timestamp";
    pub const SOURCE: &str = "source";

    /// `region` value meaning "not tied to a city/state".
    pub const REGION_ALL: &str = "all";
}

/// The four kinds of notification the gateway understands.
///
/// The serialized name doubles as the outbound WebSocket event name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlertKind {
    EmergencyAlert,
    DisasterWarning,
    EvacuationNotice,
    SystemNotification,
}

impl AlertKind {
    pub const ALL: [AlertKind; 4] = [
        AlertKind::EmergencyAlert,
        AlertKind::DisasterWarning,
        AlertKind::EvacuationNotice,
        AlertKind::SystemNotification,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            AlertKind::EmergencyAlert => "emergency-alert",
            AlertKind::DisasterWarning => "disaster-warning",
            AlertKind::EvacuationNotice => "evacuation-notice",
            AlertKind::SystemNotification => "system-notification",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert severity, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    High,
    Critical,
}

impl Severity {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// `high` and `critical` alerts are additionally framed as emergency alerts.
    pub const fn is_escalated(&self) -> bool {
        matches!(self, Severity::High | Severity::Critical)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown severity: {0}")]
pub struct UnknownSeverity(pub String);

impl FromStr for Severity {
    type Err = UnknownSeverity;

    /// Case-insensitive. Legacy producers still send `low`/`medium`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" | "low" => Ok(Severity::Info),
            "warning" | "medium" => Ok(Severity::Warning),
            "high" => Ok(Severity::High),
            "critical" | "extreme" => Ok(Severity::Critical),
            _ => Err(UnknownSeverity(s.to_owned())),
        }
    }
}

/// Location block of an alert document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertLocation {
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

impl AlertLocation {
    /// The alert's center, if both coordinates are present and in range.
    pub fn point(&self) -> Option<GeoPoint> {
        let point = GeoPoint::new(self.latitude?, self.longitude?);
        point.is_valid().then_some(point)
    }
}

/// An alert document as read from the alert store.
///
/// Only documents with `active == true` are considered by the matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveAlert {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Disaster type, e.g. `flood` or `earthquake`.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub disaster_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default)]
    pub location: AlertLocation,
    /// Affected radius in meters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default)]
    pub evacuation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evacuation_zone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evacuation_routes: Option<Vec<String>>,
    #[serde(default)]
    pub active: bool,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub issued_at: Option<time::OffsetDateTime>,
}

impl ActiveAlert {
    /// Parsed severity; documents without a recognisable severity are
    /// treated as `high`.
    pub fn severity(&self) -> Severity {
        self.severity
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(Severity::High)
    }

    /// Effective radius in meters, falling back to `default` when the
    /// document has none or a non-positive one.
    pub fn radius_meters(&self, default: f64) -> f64 {
        match self.radius {
            Some(r) if r.is_finite() && r > 0.0 => r,
            _ => default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_match_wire_events() {
        for kind in AlertKind::ALL {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, serde_json::Value::String(kind.as_str().to_owned()));
        }
    }

    #[test]
    fn test_severity_parsing() {
        assert_eq!("CRITICAL".parse::<Severity>().unwrap(), Severity::Critical);
        assert_eq!("medium".parse::<Severity>().unwrap(), Severity::Warning);
        assert!("bogus".parse::<Severity>().is_err());
        assert!(Severity::High.is_escalated());
        assert!(!Severity::Warning.is_escalated());
    }

    #[test]
    fn test_active_alert_defaults() {
        let doc: ActiveAlert = serde_json::from_str(
            r#"{"id":"a1","active":true,"location":{"latitude":19.05,"longitude":72.9}}"#,
        )
        .unwrap();
        assert_eq!(doc.severity(), Severity::High);
        assert_eq!(doc.radius_meters(50_000.0), 50_000.0);
        assert!(doc.location.point().is_some());
        assert!(!doc.evacuation);
    }

    #[test]
    fn test_non_positive_radius_uses_default() {
        let mut doc: ActiveAlert =
            serde_json::from_str(r#"{"id":"a1","radius":-5,"location":{}}"#).unwrap();
        assert_eq!(doc.radius_meters(50_000.0), 50_000.0);
        assert!(doc.location.point().is_none());
        doc.radius = Some(12_000.0);
        assert_eq!(doc.radius_meters(50_000.0), 12_000.0);
    }
}
