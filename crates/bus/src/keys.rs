//! Recognized bus keys and their typed defaults.
//!
//! Reads of an unset key fall back to the default registered here, so every
//! consumer sees a well-typed value from the first tick.

use serde_json::{Value, json};
use std::collections::HashMap;

pub const CAMERA_ORIGIN: &str = "camera_origin";
pub const CAMERA_HEADING_COORDS: &str = "camera_heading_coords";
pub const CAMERA_HEADING_ANGLE: &str = "camera_heading_angle";
pub const LATEST_GPS_DATA: &str = "latest_gps_data";
pub const LAST_GPS_TIME: &str = "last_gps_time";
pub const TILT_OFFSET: &str = "tilt_offset";
pub const CAMERA_VERTICAL_DISTANCE: &str = "camera_vertical_distance";
pub const CAMERA_CALIBRATE_ORIGIN: &str = "camera_calibrate_origin";
pub const CAMERA_CALIBRATE_HEADING: &str = "camera_calibrate_heading";
pub const CALIBRATE_PAN_CENTER: &str = "calibrate_pan_center";
pub const CAMERA_ZOOM_VALUE: &str = "camera_zoom_value";
pub const CAMERA_ZOOM_MULTIPLIER: &str = "camera_zoom_multiplier";
pub const TRACKING_ENABLED: &str = "tracking_enabled";
pub const SPEED_CONTROL_MODE_THRESHOLD: &str = "speed_control_mode_threshold";
pub const MAX_PAN_SPEED: &str = "max_pan_speed";
pub const START_PAIRING: &str = "start_pairing";
pub const CANCEL_PAIRING: &str = "cancel_pairing";
pub const CHECK_PAIRING: &str = "check_pairing";
pub const START_RECORDING: &str = "start_recording";
pub const IS_RECORDING: &str = "is_recording";
pub const ENABLE_AUTO_RECORDING: &str = "enable_auto_recording";
pub const SESSION_ID: &str = "SessionID";
pub const SESSION_START_TIME: &str = "SessionStartTime";
pub const CAMERA_SECURITY_TOKEN: &str = "CameraSecurityToken";
pub const ERROR_STATES: &str = "ErrorStates";
pub const IS_PAIRED: &str = "IsPaired";
pub const STOP: &str = "stop";

pub(crate) fn defaults() -> HashMap<&'static str, Value> {
    HashMap::from([
        (CAMERA_ORIGIN, Value::Null),
        (CAMERA_HEADING_COORDS, Value::Null),
        (CAMERA_HEADING_ANGLE, json!(0.0)),
        (
            LATEST_GPS_DATA,
            json!({ "latitude": 0.0, "longitude": 0.0 }),
        ),
        (LAST_GPS_TIME, json!(0.0)),
        (TILT_OFFSET, json!(0.0)),
        (CAMERA_VERTICAL_DISTANCE, json!(8.0)),
        (CAMERA_CALIBRATE_ORIGIN, json!(false)),
        (CAMERA_CALIBRATE_HEADING, json!(false)),
        (CALIBRATE_PAN_CENTER, json!(false)),
        (CAMERA_ZOOM_VALUE, json!(1.0)),
        (CAMERA_ZOOM_MULTIPLIER, json!(1.0)),
        (TRACKING_ENABLED, json!(false)),
        (SPEED_CONTROL_MODE_THRESHOLD, json!(0.1)),
        (MAX_PAN_SPEED, json!(6.0)),
        (START_PAIRING, json!(false)),
        (CANCEL_PAIRING, json!(false)),
        (CHECK_PAIRING, json!(false)),
        (START_RECORDING, json!(false)),
        (IS_RECORDING, json!(false)),
        (ENABLE_AUTO_RECORDING, json!(false)),
        (SESSION_ID, json!(-1)),
        (SESSION_START_TIME, json!(0.0)),
        (CAMERA_SECURITY_TOKEN, json!("")),
        (ERROR_STATES, json!("")),
        (IS_PAIRED, json!(false)),
        (STOP, json!(false)),
    ])
}
