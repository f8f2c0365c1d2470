use serde::{Deserialize, Serialize};

/// A point on the earth's surface in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Build a point from a GeoJSON `[longitude, latitude]` pair.
    pub const fn from_geojson(pair: [f64; 2]) -> Self {
        Self::new(pair[1], pair[0])
    }

    /// Returns `true` if both components are finite and inside the WGS84 ranges.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geojson_order_is_lon_lat() {
        let p = GeoPoint::from_geojson([72.88, 19.08]);
        assert_eq!(p.latitude, 19.08);
        assert_eq!(p.longitude, 72.88);
    }

    #[test]
    fn test_validity() {
        assert!(GeoPoint::new(19.0, 72.0).is_valid());
        assert!(!GeoPoint::new(91.0, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, -180.5).is_valid());
        assert!(!GeoPoint::new(f64::NAN, 0.0).is_valid());
    }
}
