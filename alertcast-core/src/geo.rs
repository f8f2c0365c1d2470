//! Geographic helpers: great-circle distance, location normalization and
//! place-name slugs.
//!
//! Clients send their position in several shapes. Everything that ingests a
//! location goes through [`normalize_location`], so downstream code only
//! ever sees a validated [`GeoPoint`].

use alertcast_sdk::objects::GeoPoint;
use compact_str::CompactString;
use serde_json::{Map, Value};
use thiserror::Error;

/// Mean earth radius (IUGG) in meters.
pub const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

/// Nested `location` objects are followed at most this deep.
const MAX_NESTING: usize = 2;

/// Great-circle distance between two points in meters (haversine).
pub fn distance_meters(a: GeoPoint, b: GeoPoint) -> f64 {
    let phi1 = a.latitude.to_radians();
    let phi2 = b.latitude.to_radians();
    let d_phi = (b.latitude - a.latitude).to_radians();
    let d_lambda = (b.longitude - a.longitude).to_radians();

    let h = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_METERS * h.sqrt().min(1.0).asin()
}

/// Why a raw location could not be turned into a point.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LocationError {
    #[error("location must be a JSON object")]
    NotAnObject,

    #[error("unrecognized location shape")]
    UnrecognizedShape,

    #[error("coordinates out of range: latitude {latitude}, longitude {longitude}")]
    OutOfRange { latitude: f64, longitude: f64 },
}

/// Normalize a client-supplied location into a [`GeoPoint`].
///
/// Accepted shapes:
/// - `{"latitude": 19.07, "longitude": 72.87}` (also `lat` / `lng` / `lon`)
/// - `{"coordinates": [72.87, 19.07]}` in GeoJSON `[lon, lat]` order
/// - `{"coordinates": {"latitude": .., "longitude": ..}}`
/// - `{"location": {"coordinates": [..]}}`, i.e. one of the above nested
pub fn normalize_location(raw: &Value) -> Result<GeoPoint, LocationError> {
    normalize_nested(raw, 0)
}

fn normalize_nested(raw: &Value, depth: usize) -> Result<GeoPoint, LocationError> {
    let obj = raw.as_object().ok_or(LocationError::NotAnObject)?;

    let point = if let Some(point) = lat_lon_fields(obj) {
        point
    } else if let Some(coordinates) = obj.get("coordinates") {
        coordinates_value(coordinates).ok_or(LocationError::UnrecognizedShape)?
    } else if let Some(inner) = obj.get("location").filter(|_| depth < MAX_NESTING) {
        return normalize_nested(inner, depth + 1);
    } else {
        return Err(LocationError::UnrecognizedShape);
    };

    if point.is_valid() {
        Ok(point)
    } else {
        Err(LocationError::OutOfRange {
            latitude: point.latitude,
            longitude: point.longitude,
        })
    }
}

fn coordinates_value(value: &Value) -> Option<GeoPoint> {
    match value {
        Value::Array(pair) if pair.len() == 2 => {
            Some(GeoPoint::from_geojson([number(&pair[0])?, number(&pair[1])?]))
        }
        Value::Object(obj) => lat_lon_fields(obj),
        _ => None,
    }
}

fn lat_lon_fields(obj: &Map<String, Value>) -> Option<GeoPoint> {
    let latitude = ["latitude", "lat"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(number))?;
    let longitude = ["longitude", "lng", "lon"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(number))?;
    Some(GeoPoint::new(latitude, longitude))
}

/// Numbers, or strings holding a number (form posts send those).
fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// City and state names carried next to the coordinates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Place {
    pub city: Option<CompactString>,
    pub state: Option<CompactString>,
}

impl Place {
    /// Read `city` / `state` from a raw location object, following the same
    /// nesting as [`normalize_location`].
    pub fn from_raw(raw: &Value) -> Self {
        let mut current = raw;
        let mut place = Place::default();
        for _ in 0..=MAX_NESTING {
            let Some(obj) = current.as_object() else { break };
            place.city = place.city.or_else(|| text(obj, "city"));
            place.state = place.state.or_else(|| text(obj, "state"));
            match obj.get("location") {
                Some(inner) => current = inner,
                None => break,
            }
        }
        place
    }

    pub fn is_empty(&self) -> bool {
        self.city.is_none() && self.state.is_none()
    }
}

fn text(obj: &Map<String, Value>, key: &str) -> Option<CompactString> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(CompactString::from)
}

/// Channel-name slug: lowercase ASCII alphanumerics, every other run of
/// characters collapsed into a single `-`. Returns `None` for blank input.
pub fn slug(name: &str) -> Option<CompactString> {
    let mut out = CompactString::default();
    let mut pending_dash = false;
    for ch in name.trim().chars() {
        if ch.is_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.extend(ch.to_lowercase());
        } else {
            pending_dash = true;
        }
    }
    (!out.is_empty()).then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MUMBAI: GeoPoint = GeoPoint::new(19.0760, 72.8777);

    #[test]
    fn test_distance_to_self_is_zero() {
        assert_eq!(distance_meters(MUMBAI, MUMBAI), 0.0);
    }

    #[test]
    fn test_distance_mumbai_to_kurla() {
        let kurla = GeoPoint::new(19.0522, 72.9005);
        let d = distance_meters(MUMBAI, kurla);
        assert!((3_500.0..3_650.0).contains(&d), "distance was {d}");
        assert_eq!(d, distance_meters(kurla, MUMBAI));
    }

    #[test]
    fn test_distance_mumbai_to_delhi() {
        let delhi = GeoPoint::new(28.6139, 77.2090);
        let d = distance_meters(MUMBAI, delhi);
        assert!((1_140_000.0..1_160_000.0).contains(&d), "distance was {d}");
    }

    #[test]
    fn test_normalize_lat_lon_object() {
        let p = normalize_location(&json!({"latitude": 19.08, "longitude": 72.88})).unwrap();
        assert_eq!(p, GeoPoint::new(19.08, 72.88));

        let p = normalize_location(&json!({"lat": 19.08, "lng": 72.88})).unwrap();
        assert_eq!(p, GeoPoint::new(19.08, 72.88));
    }

    #[test]
    fn test_normalize_geojson_coordinates() {
        let p = normalize_location(&json!({"coordinates": [72.88, 19.08]})).unwrap();
        assert_eq!(p.latitude, 19.08);
        assert_eq!(p.longitude, 72.88);
    }

    #[test]
    fn test_normalize_coordinates_object() {
        let raw = json!({"coordinates": {"latitude": 19.08, "longitude": 72.88}});
        assert_eq!(normalize_location(&raw).unwrap(), GeoPoint::new(19.08, 72.88));
    }

    #[test]
    fn test_normalize_nested_location() {
        let raw = json!({"location": {"city": "Mumbai", "coordinates": [72.88, 19.08]}});
        assert_eq!(normalize_location(&raw).unwrap(), GeoPoint::new(19.08, 72.88));
    }

    #[test]
    fn test_normalize_rejects_unknown_and_out_of_range() {
        assert_eq!(
            normalize_location(&json!({"city": "Mumbai"})),
            Err(LocationError::UnrecognizedShape)
        );
        assert_eq!(
            normalize_location(&json!("19.0,72.0")),
            Err(LocationError::NotAnObject)
        );
        assert_eq!(
            normalize_location(&json!({"coordinates": [1.0]})),
            Err(LocationError::UnrecognizedShape)
        );
        assert!(matches!(
            normalize_location(&json!({"latitude": 120.0, "longitude": 0.0})),
            Err(LocationError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_place_from_raw() {
        let place = Place::from_raw(&json!({"city": " Navi Mumbai ", "state": "Maharashtra"}));
        assert_eq!(place.city.as_deref(), Some("Navi Mumbai"));
        assert_eq!(place.state.as_deref(), Some("Maharashtra"));
        assert!(Place::from_raw(&json!({"coordinates": [1, 2]})).is_empty());
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("Mumbai").as_deref(), Some("mumbai"));
        assert_eq!(slug("  Navi   Mumbai ").as_deref(), Some("navi-mumbai"));
        assert_eq!(slug("Tamil Nadu!").as_deref(), Some("tamil-nadu"));
        assert_eq!(slug("   "), None);
    }
}
