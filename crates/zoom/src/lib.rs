//! RS-232 driver for the zoom/focus lens.
//!
//! The lens answers a VISCA-style command set over a USB-RS232 converter at
//! 9600-8N1. Zoom levels 1x..25x map onto motor positions through a
//! calibration table measured for this lens model; intermediate levels are
//! interpolated linearly.

use std::io::Write;
use std::time::Duration;
use tokio_serial::{SerialPort, SerialPortType};
use tracing::{info, warn};

/// Serial link configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Substring of the USB product description to look for
    pub port_hint: String,
    pub baud_rate: u32,
    pub read_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port_hint: "Zoom".into(),
            baud_rate: 9600,
            read_timeout: Duration::from_secs(5),
        }
    }
}

/// Motor position for each integer zoom level, index = level - 1.
///
/// Empirical lens calibration; the curve is steep at the wide end and
/// flattens toward full telephoto.
pub const ZOOM_MOTOR_POSITIONS: [u16; 25] = [
    0, 5350, 8500, 9850, 11300, 12250, 12950, 13550, 14025, 14420, 14640, 14840, 15010, 15155,
    15320, 15475, 15580, 15670, 15765, 15860, 15915, 15970, 16030, 16120, 16380,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoomDirection {
    Tele,
    Wide,
}

/// Motor position for a zoom level, interpolating between table entries.
/// Levels outside [1, 25] clamp to the table ends.
pub fn motor_position(level: f64) -> u16 {
    let level = level.clamp(1.0, 25.0);
    let index = level.floor() as usize;
    let base = ZOOM_MOTOR_POSITIONS[index - 1];
    if level.fract() == 0.0 {
        return base;
    }
    let next = ZOOM_MOTOR_POSITIONS[index];
    let interpolated = base as f64 + (level - index as f64) * (next as f64 - base as f64);
    interpolated as u16
}

/// Absolute zoom command: the 16-bit motor position split into four
/// nibbles.
pub fn zoom_position_command(position: u16) -> [u8; 9] {
    [
        0x81,
        0x01,
        0x04,
        0x47,
        ((position >> 12) & 0xF) as u8,
        ((position >> 8) & 0xF) as u8,
        ((position >> 4) & 0xF) as u8,
        (position & 0xF) as u8,
        0xFF,
    ]
}

/// Variable zoom command: speed 0..7, tele or wide.
pub fn zoom_speed_command(speed: u8, direction: ZoomDirection) -> [u8; 6] {
    let speed = speed.min(7);
    let nibble = match direction {
        ZoomDirection::Tele => 0x20 | speed,
        ZoomDirection::Wide => 0x30 | speed,
    };
    [0x81, 0x01, 0x04, 0x07, nibble, 0xFF]
}

/// Driver for the zoom lens serial link.
pub struct ZoomLens {
    port: Box<dyn SerialPort>,
}

impl ZoomLens {
    /// Discover and open the lens port, then bring the lens to a known
    /// state: minimum speed in both directions, zoom at 2x.
    pub fn connect<F: Fn() -> bool>(config: &Config, stop: F) -> Option<Self> {
        info!(hint = %config.port_hint, "Searching for zoom lens");
        let mut lens = loop {
            if stop() {
                return None;
            }
            if let Some(path) = find_port(&config.port_hint) {
                match tokio_serial::new(&path, config.baud_rate)
                    .timeout(config.read_timeout)
                    .open()
                {
                    Ok(port) => {
                        info!(port = %path, baud = config.baud_rate, "Zoom lens connected");
                        break Self { port };
                    }
                    Err(e) => warn!(port = %path, ?e, "Zoom lens open failed"),
                }
            }
            std::thread::sleep(Duration::from_millis(100));
        };

        lens.set_zoom_speed(0, ZoomDirection::Tele);
        std::thread::sleep(Duration::from_secs(1));
        lens.set_zoom_speed(0, ZoomDirection::Wide);
        std::thread::sleep(Duration::from_secs(1));
        lens.set_zoom_position(2.0);
        Some(lens)
    }

    /// Drive the lens to `level` (1x..25x). Fractional levels are allowed.
    pub fn set_zoom_position(&mut self, level: f64) -> Option<()> {
        let command = zoom_position_command(motor_position(level));
        self.send(&command)
    }

    pub fn set_zoom_speed(&mut self, speed: u8, direction: ZoomDirection) -> Option<()> {
        let command = zoom_speed_command(speed, direction);
        self.send(&command)
    }

    fn send(&mut self, command: &[u8]) -> Option<()> {
        match self.port.write_all(command) {
            Ok(()) => Some(()),
            Err(e) => {
                warn!(?e, "Zoom command failed");
                None
            }
        }
    }
}

/// Find the serial port whose USB product description contains `hint`.
fn find_port(hint: &str) -> Option<String> {
    let ports = match tokio_serial::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            warn!(?e, "Serial enumeration failed");
            return None;
        }
    };
    for port in ports {
        if let SerialPortType::UsbPort(usb) = &port.port_type {
            if usb.product.as_deref().is_some_and(|p| p.contains(hint)) {
                return Some(port.port_name);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_is_monotonic() {
        for pair in ZOOM_MOTOR_POSITIONS.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
    }

    #[test]
    fn test_integer_levels_hit_table_entries() {
        assert_eq!(motor_position(1.0), 0);
        assert_eq!(motor_position(2.0), 5350);
        assert_eq!(motor_position(5.0), 11300);
        assert_eq!(motor_position(25.0), 16380);
    }

    #[test]
    fn test_fractional_levels_interpolate() {
        // Halfway between 5x (11300) and 6x (12250).
        assert_eq!(motor_position(5.5), 11775);
        // 110 m of track distance lands here with a 1.0 multiplier.
        assert_eq!(motor_position(6.0), 12250);
    }

    #[test]
    fn test_out_of_range_levels_clamp() {
        assert_eq!(motor_position(0.0), 0);
        assert_eq!(motor_position(0.5), 0);
        assert_eq!(motor_position(30.0), 16380);
    }

    #[test]
    fn test_position_command_nibbles() {
        // 12250 = 0x2FDA
        assert_eq!(
            zoom_position_command(12250),
            [0x81, 0x01, 0x04, 0x47, 0x02, 0x0F, 0x0D, 0x0A, 0xFF]
        );
    }

    #[test]
    fn test_speed_commands() {
        assert_eq!(
            zoom_speed_command(0, ZoomDirection::Tele),
            [0x81, 0x01, 0x04, 0x07, 0x20, 0xFF]
        );
        assert_eq!(
            zoom_speed_command(3, ZoomDirection::Wide),
            [0x81, 0x01, 0x04, 0x07, 0x33, 0xFF]
        );
        // Speed caps at 7.
        assert_eq!(zoom_speed_command(9, ZoomDirection::Tele)[4], 0x27);
    }
}
