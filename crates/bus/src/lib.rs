//! Shared state bus for the surf camera.
//!
//! Every long-lived task (tracking loop, auto-recorder, video recorder,
//! operator surface) coordinates exclusively through this keyed store.
//! Individual key reads and writes are atomic; there are no multi-key
//! transactions. A chosen subset of keys is snapshotted to a JSON file so
//! calibration survives reboots.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use types::GeoPoint;

pub mod keys;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Keys whose values make up the persisted configuration file.
pub const PERSISTED_KEYS: &[&str] = &[
    keys::CAMERA_ORIGIN,
    keys::CAMERA_HEADING_COORDS,
    keys::CAMERA_HEADING_ANGLE,
    keys::TILT_OFFSET,
    keys::CAMERA_VERTICAL_DISTANCE,
    keys::CAMERA_ZOOM_MULTIPLIER,
    keys::CAMERA_SECURITY_TOKEN,
];

/// Process-wide keyed store.
///
/// Readers and writers may live on any thread; per-key operations take the
/// inner lock for the duration of a single get or set.
pub struct StateBus {
    inner: RwLock<HashMap<String, Value>>,
    defaults: HashMap<&'static str, Value>,
}

impl StateBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(HashMap::new()),
            defaults: keys::defaults(),
        })
    }

    /// Raw read. `None` when the key has never been written.
    pub fn get_raw(&self, key: &str) -> Option<Value> {
        self.inner.read().unwrap().get(key).cloned()
    }

    /// Raw write.
    pub fn set_raw(&self, key: &str, value: Value) {
        self.inner.write().unwrap().insert(key.to_string(), value);
    }

    /// Write only if the key has never been set.
    pub fn set_initial(&self, key: &str, value: Value) {
        let mut map = self.inner.write().unwrap();
        map.entry(key.to_string()).or_insert(value);
    }

    /// Typed read with fallback to the key's registered default.
    pub fn get<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        if let Some(value) = self.get_raw(key) {
            match serde_json::from_value(value) {
                Ok(v) => return v,
                Err(e) => warn!(key, ?e, "Stored value does not decode, using default"),
            }
        }
        self.defaults
            .get(key)
            .and_then(|d| serde_json::from_value(d.clone()).ok())
            .unwrap_or_default()
    }

    /// Typed write.
    pub fn set<T: Serialize>(&self, key: &str, value: T) {
        match serde_json::to_value(value) {
            Ok(v) => self.set_raw(key, v),
            Err(e) => error!(key, ?e, "Value does not serialize, dropping write"),
        }
    }

    /// Atomically read a boolean flag and clear it.
    ///
    /// Command flags on the bus are one-shot; the handler that observes a
    /// raised flag is the one that consumes it.
    pub fn take_flag(&self, key: &str) -> bool {
        let mut map = self.inner.write().unwrap();
        let raised = map
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or_else(|| {
                self.defaults
                    .get(key)
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
            });
        if raised {
            map.insert(key.to_string(), Value::Bool(false));
        }
        raised
    }

    /// Effective value of a key: stored if present, registered default
    /// otherwise, JSON null for unknown keys.
    fn effective(&self, key: &str) -> Value {
        self.get_raw(key)
            .or_else(|| self.defaults.get(key).cloned())
            .unwrap_or(Value::Null)
    }

    /// Merge the listed keys' current values into the JSON file at `path`,
    /// preserving any keys already in the file that are not listed.
    ///
    /// Retries transient failures; a persistent failure is logged and
    /// swallowed so that persistence never stalls the control loop. The
    /// in-memory store stays authoritative for the session either way.
    pub fn snapshot(&self, keep: &[&str], path: &Path) {
        for attempt in 0..3 {
            match self.try_snapshot(keep, path) {
                Ok(()) => return,
                Err(e) if attempt < 2 => {
                    warn!(?e, attempt, "Snapshot failed, retrying");
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    error!(?e, path = %path.display(), "Snapshot failed, state not persisted");
                    return;
                }
            }
        }
    }

    pub fn try_snapshot(&self, keep: &[&str], path: &Path) -> Result<(), BusError> {
        let mut merged: serde_json::Map<String, Value> = match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(_) => serde_json::Map::new(),
        };
        for key in keep {
            merged.insert(key.to_string(), self.effective(key));
        }
        let text = serde_json::to_string_pretty(&Value::Object(merged))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, path)?;
        debug!(path = %path.display(), keys = keep.len(), "State snapshot written");
        Ok(())
    }

    /// Push every key of the JSON file at `path` into the store.
    pub fn load(&self, path: &Path) -> Result<(), BusError> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No persisted state, starting clean");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let data: serde_json::Map<String, Value> = serde_json::from_str(&text)?;
        let count = data.len();
        for (key, value) in data {
            self.set_raw(&key, value);
        }
        info!(path = %path.display(), count, "Persisted state loaded");
        Ok(())
    }

    /// Shared shutdown flag observed by every task.
    pub fn stop_requested(&self) -> bool {
        self.get::<bool>(keys::STOP)
    }

    pub fn request_stop(&self) {
        self.set(keys::STOP, true);
    }
}

/// GPS and calibration keys.
#[derive(Clone)]
pub struct GpsData {
    bus: Arc<StateBus>,
}

impl GpsData {
    pub fn new(bus: Arc<StateBus>) -> Self {
        Self { bus }
    }

    pub fn camera_origin(&self) -> Option<GeoPoint> {
        self.bus.get(keys::CAMERA_ORIGIN)
    }

    pub fn set_camera_origin(&self, p: GeoPoint) {
        self.bus.set(keys::CAMERA_ORIGIN, p);
    }

    pub fn camera_heading_coords(&self) -> Option<GeoPoint> {
        self.bus.get(keys::CAMERA_HEADING_COORDS)
    }

    pub fn set_camera_heading_coords(&self, p: GeoPoint) {
        self.bus.set(keys::CAMERA_HEADING_COORDS, p);
    }

    /// Installed bearing of pan-zero, radians.
    pub fn camera_heading_angle(&self) -> f64 {
        self.bus.get(keys::CAMERA_HEADING_ANGLE)
    }

    pub fn set_camera_heading_angle(&self, rad: f64) {
        self.bus.set(keys::CAMERA_HEADING_ANGLE, rad);
    }

    pub fn latest_gps_data(&self) -> GeoPoint {
        self.bus.get(keys::LATEST_GPS_DATA)
    }

    pub fn set_latest_gps_data(&self, p: GeoPoint) {
        self.bus.set(keys::LATEST_GPS_DATA, p);
    }

    pub fn last_gps_time(&self) -> f64 {
        self.bus.get(keys::LAST_GPS_TIME)
    }

    pub fn set_last_gps_time(&self, t: f64) {
        self.bus.set(keys::LAST_GPS_TIME, t);
    }

    pub fn tilt_offset(&self) -> f64 {
        self.bus.get(keys::TILT_OFFSET)
    }

    pub fn camera_vertical_distance(&self) -> f64 {
        self.bus.get(keys::CAMERA_VERTICAL_DISTANCE)
    }
}

/// Operator command flags and tuning values.
#[derive(Clone)]
pub struct Commands {
    bus: Arc<StateBus>,
}

impl Commands {
    pub fn new(bus: Arc<StateBus>) -> Self {
        Self { bus }
    }

    pub fn tracking_enabled(&self) -> bool {
        self.bus.get(keys::TRACKING_ENABLED)
    }

    pub fn take_calibrate_origin(&self) -> bool {
        self.bus.take_flag(keys::CAMERA_CALIBRATE_ORIGIN)
    }

    pub fn take_calibrate_heading(&self) -> bool {
        self.bus.take_flag(keys::CAMERA_CALIBRATE_HEADING)
    }

    pub fn take_calibrate_pan_center(&self) -> bool {
        self.bus.take_flag(keys::CALIBRATE_PAN_CENTER)
    }

    pub fn take_start_pairing(&self) -> bool {
        self.bus.take_flag(keys::START_PAIRING)
    }

    pub fn raise_start_pairing(&self) {
        self.bus.set(keys::START_PAIRING, true);
    }

    pub fn take_cancel_pairing(&self) -> bool {
        self.bus.take_flag(keys::CANCEL_PAIRING)
    }

    pub fn take_check_pairing(&self) -> bool {
        self.bus.take_flag(keys::CHECK_PAIRING)
    }

    /// Pan rate (deg/s) above which the loop prefers velocity control.
    pub fn speed_control_mode_threshold(&self) -> f64 {
        self.bus.get(keys::SPEED_CONTROL_MODE_THRESHOLD)
    }

    pub fn max_pan_speed(&self) -> f64 {
        self.bus.get(keys::MAX_PAN_SPEED)
    }

    pub fn camera_zoom_value(&self) -> f64 {
        self.bus.get(keys::CAMERA_ZOOM_VALUE)
    }

    pub fn set_camera_zoom_value(&self, level: f64) {
        self.bus.set(keys::CAMERA_ZOOM_VALUE, level);
    }

    pub fn camera_zoom_multiplier(&self) -> f64 {
        self.bus.get(keys::CAMERA_ZOOM_MULTIPLIER)
    }
}

/// Recording flags shared with the video subsystem.
#[derive(Clone)]
pub struct CameraState {
    bus: Arc<StateBus>,
}

impl CameraState {
    pub fn new(bus: Arc<StateBus>) -> Self {
        Self { bus }
    }

    pub fn start_recording(&self) -> bool {
        self.bus.get(keys::START_RECORDING)
    }

    pub fn set_start_recording(&self, v: bool) {
        self.bus.set(keys::START_RECORDING, v);
    }

    pub fn is_recording(&self) -> bool {
        self.bus.get(keys::IS_RECORDING)
    }

    pub fn set_is_recording(&self, v: bool) {
        self.bus.set(keys::IS_RECORDING, v);
    }

    pub fn enable_auto_recording(&self) -> bool {
        self.bus.get(keys::ENABLE_AUTO_RECORDING)
    }

    pub fn set_enable_auto_recording(&self, v: bool) {
        self.bus.set(keys::ENABLE_AUTO_RECORDING, v);
    }
}

/// Session identity and status surfaced to the operator UI and cloud API.
#[derive(Clone)]
pub struct WebApp {
    bus: Arc<StateBus>,
}

impl WebApp {
    pub fn new(bus: Arc<StateBus>) -> Self {
        Self { bus }
    }

    /// Current session, -1 when none is active.
    pub fn session_id(&self) -> i64 {
        self.bus.get(keys::SESSION_ID)
    }

    pub fn set_session_id(&self, id: i64) {
        self.bus.set(keys::SESSION_ID, id);
    }

    pub fn set_session_start_time(&self, t: f64) {
        self.bus.set(keys::SESSION_START_TIME, t);
    }

    pub fn set_is_paired(&self, v: bool) {
        self.bus.set(keys::IS_PAIRED, v);
    }

    pub fn error_states(&self) -> String {
        self.bus.get(keys::ERROR_STATES)
    }

    pub fn set_error_states(&self, s: &str) {
        self.bus.set(keys::ERROR_STATES, s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_for_unset_keys() {
        let bus = StateBus::new();
        assert!(!bus.get::<bool>(keys::TRACKING_ENABLED));
        assert_eq!(bus.get::<i64>(keys::SESSION_ID), -1);
        assert!((bus.get::<f64>(keys::CAMERA_VERTICAL_DISTANCE) - 8.0).abs() < 1e-12);
        assert!(
            (bus.get::<f64>(keys::SPEED_CONTROL_MODE_THRESHOLD) - 0.1).abs() < 1e-12
        );
        assert_eq!(bus.get::<Option<GeoPoint>>(keys::CAMERA_ORIGIN), None);
    }

    #[test]
    fn test_set_initial_does_not_overwrite() {
        let bus = StateBus::new();
        bus.set(keys::MAX_PAN_SPEED, 3.0);
        bus.set_initial(keys::MAX_PAN_SPEED, serde_json::json!(6.0));
        assert!((bus.get::<f64>(keys::MAX_PAN_SPEED) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_take_flag_consumes() {
        let bus = StateBus::new();
        let commands = Commands::new(bus.clone());
        bus.set(keys::START_PAIRING, true);
        assert!(commands.take_start_pairing());
        assert!(!commands.take_start_pairing());
    }

    #[test]
    fn test_snapshot_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let bus = StateBus::new();
        let gps = GpsData::new(bus.clone());
        gps.set_camera_origin(GeoPoint::new(38.5, -9.2));
        gps.set_camera_heading_angle(1.25);
        bus.try_snapshot(
            &[keys::CAMERA_ORIGIN, keys::CAMERA_HEADING_ANGLE],
            &path,
        )
        .unwrap();

        let fresh = StateBus::new();
        fresh.load(&path).unwrap();
        let gps2 = GpsData::new(fresh.clone());
        assert_eq!(gps2.camera_origin(), Some(GeoPoint::new(38.5, -9.2)));
        assert!((gps2.camera_heading_angle() - 1.25).abs() < 1e-12);
    }

    #[test]
    fn test_snapshot_preserves_unlisted_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{"tilt_offset": 2.5}"#).unwrap();

        let bus = StateBus::new();
        bus.set(keys::CAMERA_HEADING_ANGLE, 0.5);
        bus.try_snapshot(&[keys::CAMERA_HEADING_ANGLE], &path).unwrap();

        let fresh = StateBus::new();
        fresh.load(&path).unwrap();
        assert!((fresh.get::<f64>(keys::TILT_OFFSET) - 2.5).abs() < 1e-12);
        assert!((fresh.get::<f64>(keys::CAMERA_HEADING_ANGLE) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_load_missing_file_is_clean_start() {
        let bus = StateBus::new();
        assert!(bus.load(Path::new("/nonexistent/state.json")).is_ok());
    }

    #[test]
    fn test_stop_flag() {
        let bus = StateBus::new();
        assert!(!bus.stop_requested());
        bus.request_stop();
        assert!(bus.stop_requested());
    }
}
