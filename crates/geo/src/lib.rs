//! Geodesy helpers for the surf camera.
//!
//! Everything the controller needs from the WGS84 world: great-circle
//! distance, the bearing between two points in the frame the pan servo is
//! installed in, angle normalization, and a course estimator for the
//! tracked target.

use types::GeoPoint;

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters (haversine).
pub fn distance_m(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let phi1 = a.latitude.to_radians();
    let phi2 = b.latitude.to_radians();
    let dphi = (b.latitude - a.latitude).to_radians();
    let dlambda = (b.longitude - a.longitude).to_radians();

    let h = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Bearing from `from` to `to` in radians.
///
/// This is the forward azimuth with the y term negated: the pan servo is
/// installed mirrored relative to compass convention, so east comes out
/// negative. Points closer than half a meter have no meaningful bearing and
/// return 0.
pub fn bearing_rad(from: &GeoPoint, to: &GeoPoint) -> f64 {
    if distance_m(from, to) < 0.5 {
        return 0.0;
    }
    let lat1 = from.latitude.to_radians();
    let lat2 = to.latitude.to_radians();
    let dlon = (to.longitude - from.longitude).to_radians();

    let y = -(dlon.sin() * lat2.cos());
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
    let bearing = y.atan2(x);
    (bearing * 100.0).round() / 100.0
}

/// Normalize an angle in degrees onto `(-180, 180]`.
pub fn normalize_deg(angle: f64) -> f64 {
    let wrapped = (angle + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped == -180.0 { 180.0 } else { wrapped }
}

/// Smallest signed angular difference `a - b` in radians.
pub fn angular_difference(a: f64, b: f64) -> f64 {
    (a - b).sin().atan2((a - b).cos())
}

/// True when the target's course points at the camera to within
/// `threshold` radians.
pub fn is_target_incoming(camera_angle: f64, course: f64, threshold: f64) -> bool {
    angular_difference(course, camera_angle).abs() <= threshold
}

/// Course of the tracked target over successive fixes, lightly smoothed.
///
/// Fixes closer than half a meter are ignored so that GPS jitter at rest
/// does not spin the estimate.
#[derive(Debug, Default)]
pub struct CourseEstimator {
    prev: Option<GeoPoint>,
    course: f64,
    prev_course: f64,
}

impl CourseEstimator {
    const ALPHA: f64 = 0.1;

    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the latest fix; returns the smoothed course in radians.
    pub fn update(&mut self, point: GeoPoint) -> f64 {
        if let Some(prev) = self.prev {
            let moved = prev.latitude != 0.0
                && prev.longitude != 0.0
                && distance_m(&prev, &point) > 0.5;
            if moved {
                let course = bearing_rad(&point, &prev);
                self.course = Self::ALPHA * self.prev_course + (1.0 - Self::ALPHA) * course;
            }
        }
        self.prev = Some(point);
        self.prev_course = self.course;
        self.course
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance() {
        let a = GeoPoint::new(38.0, -9.0);
        // One millidegree of latitude is ~111 m anywhere.
        assert!((distance_m(&a, &GeoPoint::new(38.001, -9.0)) - 111.19).abs() < 0.1);
        // Longitude shrinks with latitude.
        assert!((distance_m(&a, &GeoPoint::new(38.0, -8.999)) - 87.62).abs() < 0.1);
        assert!(distance_m(&a, &a) < 1e-9);
    }

    #[test]
    fn test_bearing_is_mirrored() {
        let origin = GeoPoint::new(38.5, -9.2);
        // Due north keeps bearing zero.
        assert!(bearing_rad(&origin, &GeoPoint::new(38.6, -9.2)).abs() < 1e-9);
        // Due east comes out negative in the servo frame.
        assert!((bearing_rad(&origin, &GeoPoint::new(38.5, -9.1)) - -1.57).abs() < 1e-9);
    }

    #[test]
    fn test_bearing_zero_when_colocated() {
        let origin = GeoPoint::new(38.5, -9.2);
        let nearby = GeoPoint::new(38.500_001, -9.2);
        assert_eq!(bearing_rad(&origin, &nearby), 0.0);
    }

    #[test]
    fn test_normalize_boundaries() {
        assert_eq!(normalize_deg(180.0), 180.0);
        assert_eq!(normalize_deg(-180.0), 180.0);
        assert_eq!(normalize_deg(181.0), -179.0);
        assert_eq!(normalize_deg(-181.0), 179.0);
        assert_eq!(normalize_deg(0.0), 0.0);
        assert_eq!(normalize_deg(540.0), 180.0);
        assert!((normalize_deg(-350.0) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_incoming_test() {
        let threshold = 10f64.to_radians();
        assert!(is_target_incoming(1.0, 1.05, threshold));
        assert!(!is_target_incoming(1.0, 1.5, threshold));
        // Wraparound at ±π.
        assert!(is_target_incoming(3.1, -3.1, threshold));
    }

    #[test]
    fn test_course_estimator_ignores_jitter() {
        let mut course = CourseEstimator::new();
        let p = GeoPoint::new(38.5, -9.2);
        assert_eq!(course.update(p), 0.0);
        // Sub-meter wobble leaves the course untouched.
        assert_eq!(course.update(GeoPoint::new(38.500_000_1, -9.2)), 0.0);
    }
}
