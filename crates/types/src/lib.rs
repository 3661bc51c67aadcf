//! Shared types and message definitions for the surf camera.

use serde::{Deserialize, Serialize};

/// A WGS84 coordinate as received from the tracker or stored in calibration.
///
/// Field names match the persisted configuration file written by earlier
/// deployments, so calibrations survive upgrades.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    /// Latitude in degrees
    pub latitude: f64,
    /// Longitude in degrees
    pub longitude: f64,
    /// Altitude in meters (rarely transmitted by the tracker)
    #[serde(default)]
    pub altitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude: 0.0,
        }
    }

    /// A coordinate is usable when it lies on the globe at all.
    pub fn is_valid(&self) -> bool {
        self.latitude.abs() <= 90.0 && self.longitude.abs() <= 180.0
    }
}

/// Geographic acceptance gate for tracker fixes.
///
/// The tracker radio occasionally emits garbage or a cold-start fix from
/// another continent; only coordinates whose integer degrees match the
/// deployment region are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptRegion {
    pub lat_deg: i32,
    pub lon_deg: i32,
}

impl Default for AcceptRegion {
    fn default() -> Self {
        // Lisbon coastal deployment
        Self {
            lat_deg: 38,
            lon_deg: -9,
        }
    }
}

impl AcceptRegion {
    pub fn contains(&self, point: &GeoPoint) -> bool {
        point.is_valid()
            && point.latitude.trunc() as i32 == self.lat_deg
            && point.longitude.trunc() as i32 == self.lon_deg
    }
}

/// A tracker fix accepted by the front board, stamped with the monotonic
/// receive time in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerFix {
    pub point: GeoPoint,
    pub t_recv: f64,
}

/// Operating mode of the pan servo.
///
/// The servo itself is the source of truth; this is the last commanded mode,
/// cached to avoid repeating the torque-off/reconfigure/torque-on dance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ControlMode {
    /// Extended position mode: seeks a goal position over a multi-turn range
    Position,
    /// Velocity mode: holds a continuous rotation rate
    Velocity,
    /// Not yet commanded (after boot or servo reboot)
    #[default]
    Unset,
}

/// Pairing state reported by the tracker radio.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PairStatus {
    pub paired: bool,
    pub pairing: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_gate() {
        let region = AcceptRegion::default();
        assert!(region.contains(&GeoPoint::new(38.5, -9.2)));
        assert!(region.contains(&GeoPoint::new(38.001, -9.999)));
        assert!(!region.contains(&GeoPoint::new(0.0, 0.0)));
        assert!(!region.contains(&GeoPoint::new(39.0, -9.2)));
        assert!(!region.contains(&GeoPoint::new(38.5, -8.9)));
    }

    #[test]
    fn test_validity() {
        assert!(GeoPoint::new(38.5, -9.2).is_valid());
        assert!(!GeoPoint::new(91.0, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, 181.0).is_valid());
    }

    #[test]
    fn test_geopoint_json_field_names() {
        let p = GeoPoint::new(38.5, -9.2);
        let json = serde_json::to_value(p).unwrap();
        assert!(json.get("latitude").is_some());
        assert!(json.get("longitude").is_some());
    }
}
