//! Motion controller for the geared pan/tilt head.
//!
//! Converts pan/tilt angles and rates into Dynamixel encoder units and
//! drives both servos through the front board. The pan axis runs in one of
//! two servo modes: Extended Position for slow, precise moves and Velocity
//! for smooth continuous rotation; switching modes requires a torque-off
//! reconfiguration, so the last commanded mode is cached and re-commands are
//! no-ops.
//!
//! All pan angles are measured from `pan_center_pulse`, the encoder value at
//! the mechanical center found by the hall-sensor calibration.

use frontboard::FrontBoard;
use frontboard::protocol::GroupWriteEntry;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use types::ControlMode;

/// Pan axis reduction between servo and camera.
pub const PAN_GEAR_RATIO: f64 = 40.0;
/// Tilt axis reduction between servo and camera.
pub const TILT_GEAR_RATIO: f64 = 5.6;
/// Pan travel, degrees each way from zero.
pub const MAX_PAN_ANGLE: f64 = 70.0;
/// Tilt travel, degrees down from zero.
pub const MAX_TILT_ANGLE: f64 = 25.0;
/// Degrees per encoder pulse (4096 pulses per turn).
pub const DEG_PULSE: f64 = 0.088;
/// Tilt servo pulse at 0 degrees.
pub const TILT_ZERO_PULSE: i32 = 750;

const TILT_ID: u8 = 1;
const PAN_ID: u8 = 2;

/// Dynamixel X-series control table addresses used here.
mod reg {
    pub const DRIVE_MODE: u16 = 10;
    pub const OPERATING_MODE: u16 = 11;
    pub const VELOCITY_LIMIT: u16 = 44;
    pub const TORQUE_ENABLE: u16 = 64;
    pub const VELOCITY_I_GAIN: u16 = 76;
    pub const VELOCITY_P_GAIN: u16 = 78;
    pub const POSITION_D_GAIN: u16 = 80;
    pub const POSITION_I_GAIN: u16 = 82;
    pub const POSITION_P_GAIN: u16 = 84;
    pub const GOAL_VELOCITY: u16 = 104;
    pub const PROFILE_ACCELERATION: u16 = 108;
    pub const PROFILE_VELOCITY: u16 = 112;
    pub const GOAL_POSITION: u16 = 116;
    pub const PRESENT_VELOCITY: u16 = 128;
    pub const PRESENT_POSITION: u16 = 132;
}

/// Outcome of the hall-sensor center search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationOutcome {
    Calibrated,
    TimedOut,
}

/// Pan goal position in encoder pulses.
pub fn pan_pulse(pan_deg: f64, center_pulse: i32) -> i32 {
    (pan_deg * PAN_GEAR_RATIO / DEG_PULSE).round() as i32 + center_pulse
}

/// Tilt goal position in encoder pulses, clamped to the mechanical range.
pub fn tilt_pulse(tilt_deg: f64) -> i32 {
    let tilt = tilt_deg.clamp(0.0, MAX_TILT_ANGLE);
    (tilt * TILT_GEAR_RATIO / DEG_PULSE + TILT_ZERO_PULSE as f64).round() as i32
}

/// Degrees/second at the servo shaft to signed Dynamixel velocity units
/// (multiples of 0.229 rpm), magnitude capped at the register range.
pub fn dynamixel_velocity(degrees_per_second: f64) -> i32 {
    let rpm = degrees_per_second.abs() / 6.0;
    let units = (rpm / 0.229).min(2047.0).round() as i32;
    if degrees_per_second < 0.0 { -units } else { units }
}

/// The four register writes of one combined pan/tilt move: both goal
/// positions plus both profile velocities, issued as a single group write so
/// the axes start together.
pub fn set_angles_entries(
    pan_deg: f64,
    tilt_deg: f64,
    pan_speed_dps: f64,
    tilt_speed_dps: f64,
    center_pulse: i32,
) -> [GroupWriteEntry; 4] {
    let pan = pan_deg.clamp(-MAX_PAN_ANGLE, MAX_PAN_ANGLE);
    let tilt = tilt_deg.clamp(0.0, MAX_TILT_ANGLE);
    [
        GroupWriteEntry::new(TILT_ID, reg::GOAL_POSITION, tilt_pulse(tilt)),
        GroupWriteEntry::new(
            TILT_ID,
            reg::PROFILE_VELOCITY,
            dynamixel_velocity(tilt_speed_dps * TILT_GEAR_RATIO),
        ),
        GroupWriteEntry::new(PAN_ID, reg::GOAL_POSITION, pan_pulse(pan, center_pulse)),
        GroupWriteEntry::new(
            PAN_ID,
            reg::PROFILE_VELOCITY,
            dynamixel_velocity(pan_speed_dps * PAN_GEAR_RATIO),
        ),
    ]
}

/// Motion controller owning the front board link.
pub struct MotionController {
    board: FrontBoard,
    pan_center_pulse: i32,
    pan_mode: ControlMode,
    last_tilt_deg: f64,
    pan_play_time: f64,
    tilt_play_time: f64,
}

impl MotionController {
    /// Wrap the link and run the boot sequence: LEDs off, drive modes,
    /// tilt PID and acceleration, torque on, tilt to zero, then capture the
    /// current pan encoder as the provisional center.
    pub fn new(mut board: FrontBoard) -> Self {
        board.set_back_panel_leds(false, false);
        board.dynamixel_write(TILT_ID, reg::DRIVE_MODE, 1);
        // Pan drive mode: velocity-based profile
        board.dynamixel_write(PAN_ID, reg::DRIVE_MODE, 0);

        let mut mc = Self {
            board,
            pan_center_pulse: 0,
            pan_mode: ControlMode::Unset,
            last_tilt_deg: 0.0,
            pan_play_time: 0.5,
            tilt_play_time: 0.75,
        };
        mc.set_tilt_pid(1000, 200, 800);
        mc.board
            .dynamixel_write(TILT_ID, reg::PROFILE_ACCELERATION, 20);
        mc.set_torque(true);
        mc.set_tilt_angle(0.0, Some(1.0));
        std::thread::sleep(Duration::from_secs(1));

        match mc.board.dynamixel_read(PAN_ID, reg::PRESENT_POSITION) {
            Some(pulse) => mc.pan_center_pulse = pulse,
            None => warn!("Pan encoder read failed at boot, center pulse unset"),
        }
        info!(center = mc.pan_center_pulse, "Motion controller ready");
        mc
    }

    /// The underlying front board link, for the non-servo operations
    /// (LEDs, tracker polls, pairing).
    pub fn link(&mut self) -> &mut FrontBoard {
        &mut self.board
    }

    pub fn pan_center_pulse(&self) -> i32 {
        self.pan_center_pulse
    }

    pub fn pan_mode(&self) -> ControlMode {
        self.pan_mode
    }

    /// Torque on/off for both axes in one frame.
    pub fn set_torque(&mut self, on: bool) -> Option<()> {
        let value = on as i32;
        self.board.group_dynamixel_write(&[
            GroupWriteEntry::new(TILT_ID, reg::TORQUE_ENABLE, value),
            GroupWriteEntry::new(PAN_ID, reg::TORQUE_ENABLE, value),
        ])
    }

    pub fn set_tilt_pid(&mut self, p: i32, i: i32, d: i32) -> Option<()> {
        self.board.group_dynamixel_write(&[
            GroupWriteEntry::new(TILT_ID, reg::POSITION_P_GAIN, p),
            GroupWriteEntry::new(TILT_ID, reg::POSITION_I_GAIN, i),
            GroupWriteEntry::new(TILT_ID, reg::POSITION_D_GAIN, d),
        ])
    }

    pub fn set_pan_pid(&mut self, p: i32, i: i32, d: i32) -> Option<()> {
        self.board.group_dynamixel_write(&[
            GroupWriteEntry::new(PAN_ID, reg::POSITION_P_GAIN, p),
            GroupWriteEntry::new(PAN_ID, reg::POSITION_I_GAIN, i),
            GroupWriteEntry::new(PAN_ID, reg::POSITION_D_GAIN, d),
        ])
    }

    pub fn set_pan_velocity_pi(&mut self, p: i32, i: i32) -> Option<()> {
        self.board.group_dynamixel_write(&[
            GroupWriteEntry::new(PAN_ID, reg::VELOCITY_P_GAIN, p),
            GroupWriteEntry::new(PAN_ID, reg::VELOCITY_I_GAIN, i),
        ])
    }

    /// Move both axes together. Angles clamp to the mechanical limits;
    /// omitted speeds are derived from the intended play time of the move
    /// and capped at 2 °/s.
    pub fn set_angles(
        &mut self,
        pan_deg: f64,
        tilt_deg: f64,
        pan_speed: Option<f64>,
        tilt_speed: Option<f64>,
    ) -> Option<()> {
        let pan = pan_deg.clamp(-MAX_PAN_ANGLE, MAX_PAN_ANGLE);
        let tilt = tilt_deg.clamp(0.0, MAX_TILT_ANGLE);

        let pan_speed = match pan_speed {
            Some(s) => s,
            None => {
                let current = self.current_pan_angle().unwrap_or(0.0);
                (pan - current) / self.pan_play_time
            }
        };
        let pan_speed = pan_speed.abs().min(2.0);

        let tilt_speed = match tilt_speed {
            Some(s) => s,
            None => (tilt - self.last_tilt_deg) / self.tilt_play_time,
        };
        let tilt_speed = tilt_speed.abs().min(2.0);

        self.last_tilt_deg = tilt;
        let entries = set_angles_entries(pan, tilt, pan_speed, tilt_speed, self.pan_center_pulse);
        self.board.group_dynamixel_write(&entries)
    }

    /// Tilt-only move.
    pub fn set_tilt_angle(&mut self, tilt_deg: f64, tilt_speed: Option<f64>) -> Option<()> {
        let tilt = tilt_deg.clamp(0.0, MAX_TILT_ANGLE);
        let speed = match tilt_speed {
            Some(s) => s,
            None => (tilt - self.last_tilt_deg) / self.tilt_play_time,
        };
        let speed = speed.abs().min(2.0);
        self.last_tilt_deg = tilt;

        self.board.dynamixel_write(
            TILT_ID,
            reg::PROFILE_VELOCITY,
            dynamixel_velocity(speed * TILT_GEAR_RATIO),
        )?;
        self.board
            .dynamixel_write(TILT_ID, reg::GOAL_POSITION, tilt_pulse(tilt))
    }

    /// Pan move that bypasses the travel limits. Calibration only: the
    /// center search parks the head 120° past the hall sensor.
    pub fn set_pan_angle(&mut self, angle_deg: f64, speed: Option<f64>) -> Option<()> {
        let speed = speed.unwrap_or(1.0).abs().min(10.0);
        self.board.dynamixel_write(
            PAN_ID,
            reg::PROFILE_VELOCITY,
            dynamixel_velocity(speed * PAN_GEAR_RATIO),
        )?;
        self.board.dynamixel_write(
            PAN_ID,
            reg::GOAL_POSITION,
            pan_pulse(angle_deg, self.pan_center_pulse),
        )
    }

    /// Switch the pan servo to Extended Position mode. No-op when already
    /// there.
    pub fn set_pan_position_control(&mut self) {
        if self.pan_mode == ControlMode::Position {
            return;
        }
        self.pan_mode = ControlMode::Position;
        self.board.dynamixel_write(PAN_ID, reg::TORQUE_ENABLE, 0);
        self.set_pan_goal_velocity(0.0);
        // Extended position mode
        self.board.dynamixel_write(PAN_ID, reg::OPERATING_MODE, 4);
        self.set_pan_pid(400, 0, 100);
        self.board
            .dynamixel_write(PAN_ID, reg::PROFILE_ACCELERATION, 40);
        self.board.dynamixel_write(PAN_ID, reg::TORQUE_ENABLE, 1);
    }

    /// Switch the pan servo to Velocity mode with the given camera-side
    /// speed limit. No-op when already there.
    pub fn set_pan_velocity_control(&mut self, velocity_limit_dps: f64) {
        if self.pan_mode == ControlMode::Velocity {
            return;
        }
        self.pan_mode = ControlMode::Velocity;
        self.board.dynamixel_write(PAN_ID, reg::TORQUE_ENABLE, 0);
        self.set_pan_goal_velocity(0.0);
        // Velocity mode
        self.board.dynamixel_write(PAN_ID, reg::OPERATING_MODE, 1);
        self.board.dynamixel_write(
            PAN_ID,
            reg::VELOCITY_LIMIT,
            dynamixel_velocity(velocity_limit_dps * PAN_GEAR_RATIO),
        );
        self.set_pan_velocity_pi(160, 1600);
        self.board
            .dynamixel_write(PAN_ID, reg::PROFILE_ACCELERATION, 40);
        self.board.dynamixel_write(PAN_ID, reg::TORQUE_ENABLE, 1);
    }

    /// Continuous pan rate in camera degrees/second. Only meaningful in
    /// Velocity mode.
    pub fn set_pan_goal_velocity(&mut self, degrees_per_second: f64) -> Option<()> {
        self.board.dynamixel_write(
            PAN_ID,
            reg::GOAL_VELOCITY,
            dynamixel_velocity(degrees_per_second * PAN_GEAR_RATIO),
        )
    }

    /// Camera pan angle in degrees from the calibrated center.
    pub fn current_pan_angle(&mut self) -> Option<f64> {
        let pulse = self.board.dynamixel_read(PAN_ID, reg::PRESENT_POSITION)?;
        let angle = (pulse - self.pan_center_pulse) as f64 * 90.0 / 1024.0 / PAN_GEAR_RATIO;
        Some((angle * 100.0).round() / 100.0)
    }

    /// Reboot both servos and re-apply the boot configuration.
    pub fn reboot_servos(&mut self) {
        self.board.reboot_dynamixel();
        self.board.dynamixel_write(PAN_ID, reg::DRIVE_MODE, 0);
        self.set_tilt_pid(1000, 200, 800);
        self.board
            .dynamixel_write(TILT_ID, reg::PROFILE_ACCELERATION, 20);
        self.pan_mode = ControlMode::Unset;
        self.set_pan_position_control();
    }

    /// Find the mechanical pan center with the hall sensor.
    ///
    /// Rotates toward the sensor, slowing as the search drags on, then backs
    /// off to the mechanical center (120° offset between sensor and center)
    /// and waits for the servo to settle before capturing the new center
    /// pulse.
    pub fn calibrate_pan_center(&mut self) -> CalibrationOutcome {
        info!("Calibrating pan center, do not move the camera");
        let initial_speed = 6.0;
        // Position mode first so the velocity-mode switch applies the raised
        // speed limit.
        self.set_pan_position_control();
        self.set_pan_velocity_control(initial_speed);
        self.set_pan_goal_velocity(initial_speed);

        let search_start = Instant::now();
        loop {
            if self.hall_center_triggered() {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
            // Slow down by 0.1 °/s per second of searching.
            let speed = (initial_speed - search_start.elapsed().as_secs_f64() / 10.0).max(1.5);
            self.set_pan_goal_velocity(speed);
            if search_start.elapsed() >= Duration::from_secs(130) {
                warn!("Hall sensor not found within timeout, aborting center search");
                self.set_pan_goal_velocity(0.0);
                return CalibrationOutcome::TimedOut;
            }
        }

        info!("Hall sensor triggered");
        self.set_pan_goal_velocity(0.0);
        if let Some(pulse) = self.board.dynamixel_read(PAN_ID, reg::PRESENT_POSITION) {
            self.pan_center_pulse = pulse;
        }
        std::thread::sleep(Duration::from_millis(500));
        self.set_pan_position_control();
        self.set_pan_angle(-120.0, Some(10.0));
        std::thread::sleep(Duration::from_secs(1));

        let wait_start = Instant::now();
        loop {
            let velocity = self
                .board
                .dynamixel_read(PAN_ID, reg::PRESENT_VELOCITY)
                .map(i32::abs)
                .unwrap_or(i32::MAX);
            if velocity <= 2 {
                break;
            }
            if wait_start.elapsed() > Duration::from_secs(25) {
                warn!("Servo did not settle in time");
                self.set_pan_velocity_control(4.0);
                self.set_pan_goal_velocity(0.0);
                break;
            }
            std::thread::sleep(Duration::from_millis(100));
        }

        if let Some(pulse) = self.board.dynamixel_read(PAN_ID, reg::PRESENT_POSITION) {
            self.pan_center_pulse = pulse;
        }
        self.set_tilt_angle(0.0, Some(1.0));
        info!(center = self.pan_center_pulse, "Pan center calibrated");
        CalibrationOutcome::Calibrated
    }

    /// Hall byte 1 reads 1 while idle and 0 with the magnet under the
    /// sensor. A missed poll counts as idle.
    fn hall_center_triggered(&mut self) -> bool {
        self.board
            .hall_status()
            .and_then(|status| status.get(1).copied())
            .is_some_and(|bit| bit == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frontboard::protocol::{self, OpCode};

    #[test]
    fn test_pan_pulse_math() {
        // round(pan × 40 / 0.088) + center
        assert_eq!(pan_pulse(0.0, 2048), 2048);
        assert_eq!(pan_pulse(10.0, 2048), 2048 + 4545);
        assert_eq!(pan_pulse(-10.0, 2048), 2048 - 4545);
        assert_eq!(pan_pulse(70.0, 0), 31818);
    }

    #[test]
    fn test_tilt_pulse_math() {
        assert_eq!(tilt_pulse(0.0), 750);
        assert_eq!(tilt_pulse(25.0), 2341);
        // Clamped below zero and above max travel.
        assert_eq!(tilt_pulse(-5.0), 750);
        assert_eq!(tilt_pulse(40.0), 2341);
    }

    #[test]
    fn test_dynamixel_velocity_units() {
        // 80 °/s at the shaft → 13.33 rpm → 58 units
        assert_eq!(dynamixel_velocity(80.0), 58);
        assert_eq!(dynamixel_velocity(-80.0), -58);
        assert_eq!(dynamixel_velocity(0.0), 0);
        // Clamped at the register range, sign preserved.
        assert_eq!(dynamixel_velocity(1e6), 2047);
        assert_eq!(dynamixel_velocity(-1e6), -2047);
    }

    #[test]
    fn test_set_angles_always_four_commands() {
        for (pan, tilt) in [(0.0, 0.0), (-70.0, 25.0), (42.5, 12.0), (70.0, 0.0)] {
            let entries = set_angles_entries(pan, tilt, 0.0, 0.0, 2048);
            assert_eq!(entries.len(), 4);
            // Two goal positions and two profile velocities, one pair per axis.
            assert_eq!(entries[0].id, TILT_ID);
            assert_eq!(entries[2].id, PAN_ID);
            assert_eq!(entries[1].addr, 112);
            assert_eq!(entries[3].addr, 112);
        }
    }

    #[test]
    fn test_set_angles_clamps_to_limits() {
        let clamped = set_angles_entries(100.0, 40.0, 2.0, 2.0, 2048);
        let limit = set_angles_entries(70.0, 25.0, 2.0, 2.0, 2048);
        assert_eq!(clamped, limit);
    }

    #[test]
    fn test_set_angles_frame_is_valid() {
        let entries = set_angles_entries(10.0, 5.0, 1.0, 1.0, 2048);
        let payload = protocol::group_write_payload(&entries);
        assert_eq!(payload[0], 4);
        let frame = protocol::build_frame(OpCode::GroupDynamixelWrite, &payload).unwrap();
        let (op, parsed) = protocol::parse_frame(&frame).unwrap();
        assert_eq!(op, 0x56);
        assert_eq!(parsed, payload);
    }

    #[test]
    fn test_pan_angle_from_pulse() {
        // (pulse − center) × 90 / 1024 / 40
        let center = 2048;
        let pulse = center + 4545; // 10 degrees commanded
        let angle = (pulse - center) as f64 * 90.0 / 1024.0 / PAN_GEAR_RATIO;
        assert!((angle - 9.99).abs() < 0.02);
    }
}
