//! Automatic wave recording.
//!
//! Watches the surfer's GPS-derived speed and raises the `start_recording`
//! flag on the bus when a ride starts, lowering it when the ride ends. The
//! video subsystem owns the actual capture; this is only the trigger.
//!
//! Start and stop use different thresholds and dwell times: a ride must be
//! fast for a while before recording starts, and slow for a little longer
//! before it stops, so paddling bursts and lulls mid-wave do not chatter
//! the recorder.

use bus::{CameraState, GpsData};
use tracing::{debug, info};
use types::GeoPoint;

/// Trigger tuning.
#[derive(Debug, Clone)]
pub struct Config {
    /// Speed that must be exceeded to start a wave, m/s
    pub start_speed: f64,
    /// Speed that must be undercut to end a wave, m/s
    pub stop_speed: f64,
    /// How long the start speed must hold, seconds
    pub start_dwell: f64,
    /// How long the stop speed must hold, seconds
    pub stop_dwell: f64,
    /// Weight of a fresh speed sample in the moving average
    pub smoothing: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            start_speed: 2.5,
            stop_speed: 2.25,
            start_dwell: 3.0,
            stop_dwell: 4.0,
            smoothing: 0.34,
        }
    }
}

/// Surfer speed from consecutive fixes, exponentially smoothed.
///
/// Updates are skipped while the previous coordinate is still the zero
/// default or time runs backwards; the last smoothed value holds through
/// such gaps.
#[derive(Debug, Default)]
pub struct SpeedEstimator {
    smoothing: f64,
    prev_point: GeoPoint,
    prev_time: f64,
    smoothed: f64,
}

impl SpeedEstimator {
    pub fn new(smoothing: f64) -> Self {
        Self {
            smoothing,
            ..Default::default()
        }
    }

    /// Feed the latest fix and its receive time; returns the smoothed
    /// speed in m/s.
    pub fn update(&mut self, point: GeoPoint, time: f64) -> f64 {
        if self.prev_point.latitude != 0.0 && self.prev_point.longitude != 0.0 {
            let dt = time - self.prev_time;
            if dt > 0.0 {
                let raw = geo::distance_m(&self.prev_point, &point) / dt;
                self.smoothed = (1.0 - self.smoothing) * self.smoothed + self.smoothing * raw;
            }
        }
        self.prev_point = point;
        self.prev_time = time;
        self.smoothed
    }

    pub fn speed(&self) -> f64 {
        self.smoothed
    }
}

/// Dual-threshold hysteresis over the speed signal.
///
/// Two timers track the last instant the speed was at or below the start
/// threshold and at or above the stop threshold; a transition fires when the
/// relevant timer has gone stale for its dwell time. At most one transition
/// per update.
#[derive(Debug)]
pub struct RecordGate {
    start_speed: f64,
    stop_speed: f64,
    start_dwell: f64,
    stop_dwell: f64,
    last_below_start: f64,
    last_above_stop: f64,
}

impl RecordGate {
    pub fn new(config: &Config) -> Self {
        Self {
            start_speed: config.start_speed,
            stop_speed: config.stop_speed,
            start_dwell: config.start_dwell,
            stop_dwell: config.stop_dwell,
            last_below_start: 0.0,
            last_above_stop: 0.0,
        }
    }

    /// Returns `Some(true)` to start recording, `Some(false)` to stop, or
    /// `None` to leave the flag alone.
    pub fn update(&mut self, speed: f64, is_recording: bool, now: f64) -> Option<bool> {
        if speed.abs() <= self.start_speed {
            self.last_below_start = now;
        }
        if speed.abs() >= self.stop_speed {
            self.last_above_stop = now;
        }

        if !is_recording && now - self.last_below_start > self.start_dwell {
            Some(true)
        } else if is_recording && now - self.last_above_stop > self.stop_dwell {
            Some(false)
        } else {
            None
        }
    }
}

/// The auto-recorder: speed estimation plus the record gate, wired to the
/// bus.
pub struct AutoRecorder {
    cam_state: CameraState,
    gps: GpsData,
    speed: SpeedEstimator,
    gate: RecordGate,
}

impl AutoRecorder {
    pub fn new(cam_state: CameraState, gps: GpsData, config: &Config) -> Self {
        cam_state.set_enable_auto_recording(true);
        Self {
            cam_state,
            gps,
            speed: SpeedEstimator::new(config.smoothing),
            gate: RecordGate::new(config),
        }
    }

    /// One observation step, driven from the tracking loop.
    pub fn tick(&mut self, now: f64) {
        if !self.cam_state.enable_auto_recording() {
            return;
        }
        let speed = self
            .speed
            .update(self.gps.latest_gps_data(), self.gps.last_gps_time());
        debug!(speed, "Surfer speed");

        match self.gate.update(speed, self.cam_state.is_recording(), now) {
            Some(true) => {
                info!(speed, "Auto recording start triggered");
                self.cam_state.set_start_recording(true);
            }
            Some(false) => {
                info!(speed, "Auto recording stop triggered");
                self.cam_state.set_start_recording(false);
            }
            None => {}
        }
    }

    /// Drop any pending record request, no questions asked. Called when the
    /// fix stream dies.
    pub fn manual_stop_recording(&mut self) {
        if self.cam_state.start_recording() {
            self.cam_state.set_start_recording(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_ema_law() {
        let mut est = SpeedEstimator::new(0.34);
        // Seed a previous coordinate.
        est.update(GeoPoint::new(38.5, -9.2), 100.0);

        // ~111 m north over 10 s: raw ≈ 11.1 m/s.
        let prev = est.speed();
        let raw = geo::distance_m(&GeoPoint::new(38.5, -9.2), &GeoPoint::new(38.501, -9.2)) / 10.0;
        let smoothed = est.update(GeoPoint::new(38.501, -9.2), 110.0);
        assert!((smoothed - (0.66 * prev + 0.34 * raw)).abs() < 1e-9);
    }

    #[test]
    fn test_speed_skips_zero_seed_and_bad_dt() {
        let mut est = SpeedEstimator::new(0.34);
        // First sample has no previous coordinate.
        assert_eq!(est.update(GeoPoint::new(38.5, -9.2), 100.0), 0.0);

        // Time going backwards keeps the old estimate.
        let before = est.speed();
        assert_eq!(est.update(GeoPoint::new(38.6, -9.2), 99.0), before);
    }

    #[test]
    fn test_gate_scenario() {
        // 0 m/s for 5 s, 3.0 m/s for 3.5 s, 0 m/s for 5 s, at 4 Hz.
        let config = Config::default();
        let mut gate = RecordGate::new(&config);
        let mut recording = false;
        let mut started_at = None;
        let mut stopped_at = None;

        let mut t = 0.0;
        while t <= 13.5 {
            let speed = if (5.0..8.5).contains(&t) { 3.0 } else { 0.0 };
            match gate.update(speed, recording, t) {
                Some(true) => {
                    recording = true;
                    started_at.get_or_insert(t);
                }
                Some(false) => {
                    recording = false;
                    stopped_at.get_or_insert(t);
                }
                None => {}
            }
            t += 0.25;
        }

        // Dwell not met at 7.5 s, start by 8.5 s.
        let started = started_at.expect("recording never started");
        assert!(started > 7.5 && started <= 8.5, "started at {started}");
        // Dwell not met at 11.5 s, stop by 12.5 s.
        let stopped = stopped_at.expect("recording never stopped");
        assert!(stopped > 11.5 && stopped <= 12.5, "stopped at {stopped}");
    }

    #[test]
    fn test_gate_band_between_thresholds_holds_state() {
        let config = Config::default();
        let mut gate = RecordGate::new(&config);

        // Warm up stopped at zero speed.
        assert_eq!(gate.update(0.0, false, 0.0), None);
        // Speed inside the 2.25..2.5 band refreshes both timers forever.
        let mut t = 0.0;
        while t < 30.0 {
            t += 0.25;
            assert_eq!(gate.update(2.4, false, t), None);
        }
    }

    #[test]
    fn test_gate_never_flips_both_ways_in_one_update() {
        let config = Config::default();
        let mut gate = RecordGate::new(&config);
        let mut t = 0.0;
        let mut recording = false;
        while t < 60.0 {
            // Alternate fast/slow stretches.
            let speed = if (t / 10.0) as i64 % 2 == 0 { 3.5 } else { 0.5 };
            if let Some(change) = gate.update(speed, recording, t) {
                // A transition must actually change the state.
                assert_ne!(change, recording);
                recording = change;
            }
            t += 0.25;
        }
    }
}
