//! Closed-loop GPS tracking core.
//!
//! A cooperative 100 Hz loop that polls the tracker radio through the front
//! board, turns accepted fixes into pan/tilt/zoom targets in the camera's
//! local frame, and arbitrates between position and velocity control for
//! smooth servo motion. Serial transactions suspend the loop for the length
//! of a round-trip, which is why the whole loop lives on its own OS thread.
//!
//! Operator commands (calibrations, pairing) arrive as one-shot flags on
//! the bus and are handled exclusively, one per tick.

pub mod rate;
pub mod zoomctl;

use autorecord::AutoRecorder;
use bus::{CameraState, Commands, GpsData, StateBus, WebApp, keys};
use frontboard::FrontBoard;
use motion::{CalibrationOutcome, MotionController};
use rate::PanRateWindow;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use types::{AcceptRegion, GeoPoint, TrackerFix};
use zoom::ZoomLens;
use zoomctl::{ZoomTable, should_push_zoom};

/// Tilt the camera rests at while tracking is off.
const STANDBY_TILT_DEG: f64 = 5.0;
/// Fix age beyond which the pan is force-stopped against drift.
const STALE_FIX_SECS: f64 = 6.0;
/// Fix age under which the back-panel LEDs signal a live link.
const FRESH_FIX_SECS: f64 = 3.0;
/// Velocity-mode speed limit at the camera, degrees/second.
const PAN_VELOCITY_LIMIT_DPS: f64 = 4.0;
/// Fixes averaged per calibration run.
const CALIBRATION_SAMPLES: usize = 50;

/// Tracking core configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub frontboard: frontboard::Config,
    pub zoom_link: zoom::Config,
    pub region: AcceptRegion,
    pub zoom_table: ZoomTable,
    pub autorecord: autorecord::Config,
    /// Servo command cadence while tracking, Hz
    pub motor_update_hz: f64,
    /// Inside this range the geometry degenerates and motion is held
    pub min_track_distance_m: f64,
    /// Velocity mode needs the pan error under this, degrees
    pub angle_error_threshold_deg: f64,
    /// Persisted-state file updated after each calibration
    pub state_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            frontboard: frontboard::Config::default(),
            zoom_link: zoom::Config::default(),
            region: AcceptRegion::default(),
            zoom_table: ZoomTable::default(),
            autorecord: autorecord::Config::default(),
            motor_update_hz: 3.0,
            min_track_distance_m: 45.0,
            angle_error_threshold_deg: 4.0,
            state_path: PathBuf::from("surfcam_state.json"),
        }
    }
}

/// Pan target in degrees for a tracked point, in the frame set by the
/// heading calibration. Positive toward the installed left of pan-zero.
pub fn pan_target_deg(origin: &GeoPoint, target: &GeoPoint, heading_rad: f64) -> f64 {
    let rotation = -(geo::bearing_rad(origin, target) - heading_rad).to_degrees();
    geo::normalize_deg(rotation)
}

/// Low-pass filter over the computed tilt angle.
///
/// Distance noise shows up amplified in tilt when the surfer is close, so
/// the raw geometry is smoothed before it reaches the servo.
#[derive(Debug, Default)]
pub struct TiltFilter {
    smoothed: f64,
}

impl TiltFilter {
    const ALPHA: f64 = 0.33;

    /// Feed the current track distance and camera height; returns the tilt
    /// command in degrees (down is positive).
    pub fn update(&mut self, distance_m: f64, height_m: f64) -> f64 {
        let raw = distance_m.atan2(height_m).to_degrees() - 90.0;
        self.smoothed = self.smoothed * (1.0 - Self::ALPHA) + raw * Self::ALPHA;
        -self.smoothed
    }
}

/// The tracking core. Owns both serial links for the life of the process.
pub struct Tracker {
    bus: Arc<StateBus>,
    gps: GpsData,
    commands: Commands,
    cam_state: CameraState,
    webapp: WebApp,
    config: Config,
    mc: MotionController,
    lens: ZoomLens,
    autorec: AutoRecorder,
    window: PanRateWindow,
    tilt: TiltFilter,
    #[cfg(feature = "incoming-assist")]
    course: geo::CourseEstimator,
    start: Instant,
}

impl Tracker {
    /// Bring up both hardware links and the motion controller. Returns
    /// `None` when shutdown is requested before the hardware appears.
    pub fn connect(bus: Arc<StateBus>, config: Config) -> Option<Self> {
        let stop = {
            let bus = bus.clone();
            move || bus.stop_requested()
        };

        let board = FrontBoard::connect(&config.frontboard, config.region, &stop)?;
        let mut mc = MotionController::new(board);
        if let Some(firmware) = mc.link().firmware() {
            info!(%firmware, "Front board firmware");
        }
        let lens = ZoomLens::connect(&config.zoom_link, &stop)?;

        let gps = GpsData::new(bus.clone());
        let cam_state = CameraState::new(bus.clone());
        let autorec = AutoRecorder::new(cam_state.clone(), gps.clone(), &config.autorecord);

        Some(Self {
            gps,
            commands: Commands::new(bus.clone()),
            cam_state,
            webapp: WebApp::new(bus.clone()),
            bus,
            config,
            mc,
            lens,
            autorec,
            window: PanRateWindow::new(),
            tilt: TiltFilter::default(),
            #[cfg(feature = "incoming-assist")]
            course: geo::CourseEstimator::new(),
            start: Instant::now(),
        })
    }

    /// Monotonic seconds since the loop came up; the timebase for fix
    /// stamps, dwell timers and cadence checks.
    fn now(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Run until the shared stop flag is raised, then park the head.
    pub fn run(&mut self) {
        // Tracking always comes up disabled; the operator turns it on.
        self.bus.set(keys::TRACKING_ENABLED, false);
        match self.gps.camera_origin() {
            Some(origin) if self.config.region.contains(&origin) => {
                info!(
                    lat = origin.latitude,
                    lon = origin.longitude,
                    "Previous origin calibration found"
                );
            }
            _ => info!("No previous origin calibration"),
        }
        info!("Tracking loop started");

        let mut led_timer = 0.0;
        let mut last_read_time = 0.0;
        let mut last_motor_update = 0.0;
        let mut parked = false;

        while !self.bus.stop_requested() {
            std::thread::sleep(Duration::from_millis(10));
            let now = self.now();

            // 1 Hz heartbeat: LEDs mirror the radio link state.
            if now - led_timer >= 1.0 {
                led_timer = now;
                let fresh = now - last_read_time < FRESH_FIX_SECS;
                self.mc.link().set_back_panel_leds(fresh, fresh);
            }

            self.dispatch_commands();

            let fix = self
                .mc
                .link()
                .tracker_message()
                .map(|point| TrackerFix { point, t_recv: now });
            if let Some(fix) = fix {
                last_read_time = fix.t_recv;
                self.gps.set_latest_gps_data(fix.point);
                self.gps.set_last_gps_time(fix.t_recv);
            }

            if !self.commands.tracking_enabled() {
                if !parked {
                    parked = true;
                    self.mc.set_pan_goal_velocity(0.0);
                    self.mc.set_pan_position_control();
                    self.mc
                        .set_angles(0.0, STANDBY_TILT_DEG, Some(1.0), Some(1.0));
                    self.window.clear();
                    debug!("Parked at standby");
                }
            } else if let Some(fix) = fix {
                parked = false;
                self.track(fix, &mut last_motor_update);
            }

            // A dead fix stream must not leave the pan spinning, or a
            // record request pending.
            if fix.is_none() && now - last_read_time >= STALE_FIX_SECS {
                self.mc.set_pan_velocity_control(PAN_VELOCITY_LIMIT_DPS);
                self.mc.set_pan_goal_velocity(0.0);
                self.autorec.manual_stop_recording();
            }
        }

        info!("Stop requested, parking");
        self.mc.set_pan_goal_velocity(0.0);
        self.mc.set_pan_position_control();
        self.mc
            .set_angles(0.0, STANDBY_TILT_DEG, Some(2.0), Some(2.0));
    }

    /// One tracking step for a fresh fix.
    fn track(&mut self, fix: TrackerFix, last_motor_update: &mut f64) {
        let TrackerFix { point, t_recv: now } = fix;
        let Some(origin) = self.gps.camera_origin() else {
            debug!("Tracking enabled but origin is not calibrated");
            return;
        };

        let distance = geo::distance_m(&origin, &point);
        let pan_target = pan_target_deg(&origin, &point, self.gps.camera_heading_angle());
        let tilt_target = self
            .tilt
            .update(distance, self.gps.camera_vertical_distance());

        // The lens motor is left alone mid-clip.
        if !self.cam_state.is_recording() {
            self.update_zoom(distance);
        }

        if now - *last_motor_update < 1.0 / self.config.motor_update_hz {
            return;
        }
        *last_motor_update = now;

        let pan_rate = self.window.push(pan_target, now);

        if distance < self.config.min_track_distance_m {
            debug!(distance, "Target too close to track, holding pan");
            self.mc.set_pan_goal_velocity(0.0);
            return;
        }

        let tilt_command = tilt_target + self.gps.tilt_offset();

        #[cfg(feature = "incoming-assist")]
        let incoming = {
            let camera_angle = geo::bearing_rad(&origin, &point);
            let course = self.course.update(point);
            geo::is_target_incoming(camera_angle, course, 10f64.to_radians())
        };
        #[cfg(not(feature = "incoming-assist"))]
        let incoming = false;

        let small_error = self
            .mc
            .current_pan_angle()
            .map(|current| (current - pan_target).abs() < self.config.angle_error_threshold_deg)
            .unwrap_or(false);

        if incoming
            || (pan_rate.abs() >= self.commands.speed_control_mode_threshold() && small_error)
        {
            // Velocity control rides through fast sweeps without the
            // stop-start texture of repeated position goals.
            self.mc.set_pan_velocity_control(PAN_VELOCITY_LIMIT_DPS);
            self.mc.set_pan_goal_velocity(pan_rate);
            self.mc.set_tilt_angle(tilt_command, None);
        } else {
            self.mc.set_pan_position_control();
            self.mc.set_angles(pan_target, tilt_command, None, None);
        }
        debug!(
            pan = format_args!("{pan_target:.2}"),
            rate = pan_rate,
            tilt = format_args!("{tilt_command:.2}"),
            "Motor update"
        );

        self.autorec.tick(now);
    }

    /// Compute and push the zoom level for the current distance, gated by
    /// the lens-protecting hysteresis.
    fn update_zoom(&mut self, distance_m: f64) {
        let level = self.config.zoom_table.level_for(distance_m)
            * self.commands.camera_zoom_multiplier();
        let level = (level * 100.0).round() / 100.0;
        if should_push_zoom(level, self.commands.camera_zoom_value())
            && self.lens.set_zoom_position(level).is_some()
        {
            self.commands.set_camera_zoom_value(level);
        }
    }

    /// Consume and handle at most one raised command flag.
    fn dispatch_commands(&mut self) {
        if self.commands.take_calibrate_origin() {
            self.handle_calibrate_origin();
        } else if self.commands.take_calibrate_heading() {
            self.handle_calibrate_heading();
        } else if self.commands.take_start_pairing() {
            self.handle_start_pairing();
        } else if self.commands.take_cancel_pairing() {
            self.handle_cancel_pairing();
        } else if self.commands.take_calibrate_pan_center() {
            self.handle_calibrate_pan_center();
        } else if self.commands.take_check_pairing() {
            self.handle_check_pairing();
        }
    }

    /// Average a buffer of valid fixes, rounded to 6 decimals (~0.1 m).
    /// `None` when shutdown interrupts the collection.
    fn collect_calibration_fixes(&mut self) -> Option<GeoPoint> {
        let mut samples: Vec<GeoPoint> = Vec::with_capacity(CALIBRATION_SAMPLES);
        while samples.len() < CALIBRATION_SAMPLES {
            if self.bus.stop_requested() {
                return None;
            }
            std::thread::sleep(Duration::from_millis(150));
            if let Some(point) = self.mc.link().tracker_message() {
                self.gps.set_latest_gps_data(point);
                samples.push(point);
            }
        }
        let n = samples.len() as f64;
        let lat = samples.iter().map(|p| p.latitude).sum::<f64>() / n;
        let lon = samples.iter().map(|p| p.longitude).sum::<f64>() / n;
        Some(GeoPoint::new(round6(lat), round6(lon)))
    }

    fn handle_calibrate_origin(&mut self) {
        info!("Calibrating camera origin, hold the tracker at the camera");
        let Some(mean) = self.collect_calibration_fixes() else {
            return;
        };
        self.gps.set_camera_origin(mean);
        self.bus
            .snapshot(&[keys::CAMERA_ORIGIN], &self.config.state_path);
        info!(
            lat = mean.latitude,
            lon = mean.longitude,
            "Camera origin calibrated"
        );
    }

    fn handle_calibrate_heading(&mut self) {
        info!("Calibrating camera heading, hold the tracker at pan-zero");
        let Some(mean) = self.collect_calibration_fixes() else {
            return;
        };
        self.gps.set_camera_heading_coords(mean);
        let Some(origin) = self.gps.camera_origin() else {
            warn!("Heading calibration needs a calibrated origin first");
            return;
        };
        let angle = geo::bearing_rad(&origin, &mean);
        self.gps.set_camera_heading_angle(angle);
        self.bus
            .snapshot(&[keys::CAMERA_HEADING_ANGLE], &self.config.state_path);
        info!(angle, "Camera heading calibrated");
    }

    fn handle_start_pairing(&mut self) {
        if let Some(status) = self.mc.link().check_tracker_pairing() {
            if !status.paired && !status.pairing {
                self.mc.link().cancel_tracker_pairing();
                self.mc.link().start_tracker_pairing();
                info!("Pairing process started");
            }
        }
    }

    fn handle_cancel_pairing(&mut self) {
        if let Some(status) = self.mc.link().check_tracker_pairing() {
            if status.paired {
                self.mc.link().cancel_tracker_pairing();
                info!("Paired tracker removed from board memory");
            }
        }
    }

    fn handle_calibrate_pan_center(&mut self) {
        match self.mc.calibrate_pan_center() {
            CalibrationOutcome::Calibrated => {}
            CalibrationOutcome::TimedOut => {
                self.webapp
                    .set_error_states("Pan center calibration timed out");
            }
        }
    }

    fn handle_check_pairing(&mut self) {
        match self.mc.link().check_tracker_pairing() {
            Some(status) if status.paired => {
                self.webapp.set_is_paired(true);
                info!("Tracker is paired");
            }
            Some(status) if !status.pairing => {
                self.webapp.set_is_paired(false);
                self.commands.raise_start_pairing();
                info!("No tracker paired, starting pairing process");
            }
            Some(_) => {
                self.webapp.set_is_paired(false);
                info!("Tracker pairing is ongoing");
            }
            None => {}
        }
    }
}

fn round6(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

/// Connect the hardware and run the tracking loop to completion.
pub fn run(bus: Arc<StateBus>, config: Config) {
    match Tracker::connect(bus, config) {
        Some(mut tracker) => tracker.run(),
        None => info!("Tracking startup aborted by shutdown"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pan_target_sign_convention() {
        let origin = GeoPoint::new(38.5, -9.2);
        // Due north with heading zero: no rotation.
        assert_eq!(pan_target_deg(&origin, &GeoPoint::new(38.6, -9.2), 0.0), 0.0);
        // Due east comes out as a positive pan after the double inversion.
        let east = pan_target_deg(&origin, &GeoPoint::new(38.5, -9.1), 0.0);
        assert!((east - 89.95).abs() < 0.5, "east pan {east}");
    }

    #[test]
    fn test_pan_target_heading_shift() {
        let origin = GeoPoint::new(38.5, -9.2);
        let east = GeoPoint::new(38.5, -9.1);
        // Installing the camera facing the target zeroes the pan.
        let heading = geo::bearing_rad(&origin, &east);
        assert_eq!(pan_target_deg(&origin, &east, heading), 0.0);
    }

    #[test]
    fn test_pan_target_is_normalized() {
        let origin = GeoPoint::new(38.5, -9.2);
        let south = GeoPoint::new(38.4, -9.2);
        // A heading of a full turn must not produce a multi-turn target.
        let pan = pan_target_deg(&origin, &south, std::f64::consts::TAU);
        assert!((-180.0..=180.0).contains(&pan));
    }

    #[test]
    fn test_tilt_filter_converges() {
        let mut filter = TiltFilter::default();
        // 100 m out, 8 m up: the commanded tilt (down-positive) settles at
        // +4.57°.
        let first = filter.update(100.0, 8.0);
        assert!((first - 1.509).abs() < 0.01, "first {first}");
        let mut last = first;
        for _ in 0..50 {
            last = filter.update(100.0, 8.0);
        }
        assert!((last - 4.574).abs() < 0.01, "converged {last}");
    }

    #[test]
    fn test_round6() {
        assert!((round6(38.123_456_789) - 38.123_457).abs() < 1e-9);
        assert!((round6(-9.199_999_95) - -9.2).abs() < 1e-9);
    }
}
