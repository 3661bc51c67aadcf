//! Serial driver for the surf camera front board.
//!
//! The front board is a microcontroller co-processor that bridges the
//! geared pan/tilt servos, the back-panel LEDs, the power button, the hall
//! sensors and the tracker radio. It speaks the framed binary protocol in
//! [`protocol`] over USB serial at 1 Mbaud.
//!
//! The port is owned exclusively by this driver for the life of the
//! process; a command/response transaction is not preemptible. Transient
//! I/O errors are logged and surface as `None` so that callers simply poll
//! again on the next tick.

pub mod protocol;

use protocol::{GroupWriteEntry, OpCode, ProtocolError};
use std::io::{Read, Write};
use std::time::Duration;
use tokio_serial::{SerialPort, SerialPortType};
use tracing::{debug, info, warn};
use types::{AcceptRegion, GeoPoint, PairStatus};

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
            port_hint: "Surf Front Board".into(),
            baud_rate: 1_000_000,
            read_timeout: Duration::from_secs(2),
        }
    }
}

/// Push-button and power-off bits reported by the board.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownState {
    pub button_pressed: bool,
    pub shutting_down: bool,
}

/// Position and velocity of both servos from one bulk read.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServoReadings {
    pub tilt_position: u16,
    pub tilt_velocity: u16,
    pub pan_position: u16,
    pub pan_velocity: u16,
}

/// Error counters and temperatures from one bulk read.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServoHealth {
    pub tilt_errors: u8,
    pub tilt_temp_c: u8,
    pub pan_errors: u8,
    pub pan_temp_c: u8,
}

/// Driver for the front board serial link.
pub struct FrontBoard {
    port: Box<dyn SerialPort>,
    region: AcceptRegion,
    last_fix: Option<GeoPoint>,
}

impl FrontBoard {
    /// Discover and open the board's serial port.
    ///
    /// The board may enumerate late on boot, so this retries until the port
    /// appears or `stop` reports true.
    pub fn connect<F: Fn() -> bool>(
        config: &Config,
        region: AcceptRegion,
        stop: F,
    ) -> Option<Self> {
        info!(hint = %config.port_hint, "Searching for front board");
        loop {
            if stop() {
                return None;
            }
            if let Some(path) = find_port(&config.port_hint) {
                match tokio_serial::new(&path, config.baud_rate)
                    .timeout(config.read_timeout)
                    .open()
                {
                    Ok(port) => {
                        info!(port = %path, baud = config.baud_rate, "Front board connected");
                        return Some(Self {
                            port,
                            region,
                            last_fix: None,
                        });
                    }
                    Err(e) => warn!(port = %path, ?e, "Front board open failed"),
                }
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    /// Build, send and read one transaction. `None` on any I/O or framing
    /// failure; the caller polls again next tick.
    pub fn transact(&mut self, op: OpCode, data: &[u8]) -> Option<Vec<u8>> {
        match self.try_transact(op, data) {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!(?op, ?e, "Front board transaction failed");
                None
            }
        }
    }

    fn try_transact(&mut self, op: OpCode, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let frame = protocol::build_frame(op, data)?;
        self.port.write_all(&frame)?;
        // The board needs a beat to assemble its response.
        std::thread::sleep(Duration::from_millis(10));
        let (_resp_op, payload) = self.read_response()?;
        Ok(payload)
    }

    fn read_response(&mut self) -> Result<(u8, Vec<u8>), ProtocolError> {
        // Preamble, op and length first; the length byte sizes the rest.
        let mut head = [0u8; 5];
        self.port.read_exact(&mut head)?;
        let len = head[4] as usize;
        let mut rest = vec![0u8; len + 2];
        self.port.read_exact(&mut rest)?;
        let mut raw = head.to_vec();
        raw.extend_from_slice(&rest);
        protocol::parse_frame(&raw)
    }

    pub fn firmware(&mut self) -> Option<String> {
        self.transact(OpCode::Firmware, &[])
            .map(|d| String::from_utf8_lossy(&d).into_owned())
    }

    pub fn mac_address(&mut self) -> Option<Vec<u8>> {
        self.transact(OpCode::GetMac, &[])
    }

    /// Drive the two back-panel LEDs; the board reads the low two bits.
    pub fn set_back_panel_leds(&mut self, first: bool, second: bool) -> Option<()> {
        let bits = (first as u8) | ((second as u8) << 1);
        self.transact(OpCode::SetBackPanelLeds, &[bits]).map(|_| ())
    }

    /// Ask the board to cut power in `seconds`.
    pub fn set_shutdown(&mut self, seconds: u16) -> Option<()> {
        let result = self
            .transact(OpCode::SetShutdown, &seconds.to_le_bytes())
            .map(|_| ());
        std::thread::sleep(Duration::from_millis(50));
        result
    }

    pub fn shutdown_state(&mut self) -> Option<ShutdownState> {
        let data = self.transact(OpCode::GetShutdownState, &[])?;
        let bits = *data.last()?;
        Some(ShutdownState {
            button_pressed: (bits >> 1) & 1 == 1,
            shutting_down: bits & 1 == 1,
        })
    }

    /// Read one register from one servo.
    pub fn dynamixel_read(&mut self, id: u8, addr: u16) -> Option<i32> {
        let data = self.transact(
            OpCode::DynamixelRead,
            &protocol::register_read_payload(id, addr),
        )?;
        protocol::parse_register_value(&data)
    }

    /// Write one register on one servo.
    pub fn dynamixel_write(&mut self, id: u8, addr: u16, value: i32) -> Option<()> {
        self.transact(
            OpCode::DynamixelWrite,
            &protocol::register_write_payload(id, addr, value),
        )
        .map(|_| ())
    }

    /// Write several registers across servos in one frame.
    pub fn group_dynamixel_write(&mut self, entries: &[GroupWriteEntry]) -> Option<()> {
        if entries.is_empty() {
            return Some(());
        }
        self.transact(
            OpCode::GroupDynamixelWrite,
            &protocol::group_write_payload(entries),
        )
        .map(|_| ())
    }

    /// Read several registers across servos in one frame; returns the raw
    /// response payload (count byte followed by big-endian values).
    pub fn group_dynamixel_read(&mut self, queries: &[(u8, u16)]) -> Option<Vec<u8>> {
        self.transact(
            OpCode::GroupDynamixelRead,
            &protocol::group_read_payload(queries),
        )
    }

    /// Bulk read of position and velocity for both servos.
    pub fn bulk_read_pos_vel(&mut self) -> Option<ServoReadings> {
        let d = self.transact(OpCode::BulkDynamixelRead, &[0x00])?;
        if d.len() < 13 {
            return None;
        }
        Some(ServoReadings {
            tilt_position: u16::from_be_bytes([d[3], d[4]]),
            tilt_velocity: u16::from_be_bytes([d[5], d[6]]),
            pan_position: u16::from_be_bytes([d[9], d[10]]),
            pan_velocity: u16::from_be_bytes([d[11], d[12]]),
        })
    }

    /// Bulk read of error count and temperature for both servos.
    pub fn bulk_read_temperature(&mut self) -> Option<ServoHealth> {
        let d = self.transact(OpCode::BulkTempRead, &[0x00])?;
        if d.len() < 7 {
            return None;
        }
        Some(ServoHealth {
            tilt_errors: d[2],
            tilt_temp_c: d[3],
            pan_errors: d[5],
            pan_temp_c: d[6],
        })
    }

    /// Raw hall sensor bytes; index 1 is the pan-center marker (1 = idle,
    /// 0 = magnet under the sensor).
    pub fn hall_status(&mut self) -> Option<Vec<u8>> {
        self.transact(OpCode::GetHallStatus, &[])
    }

    /// Poll for new tracker telemetry.
    ///
    /// Returns a fix only when the board reports one, it decodes, it lies in
    /// the acceptance region, and it differs from the previous fix.
    pub fn tracker_message(&mut self) -> Option<GeoPoint> {
        let data = self.transact(OpCode::GetTrackerMsg, &[])?;
        let point = protocol::decode_tracker_payload(&data)?;
        if !self.region.contains(&point) {
            debug!(lat = point.latitude, lon = point.longitude, "Fix outside region, dropped");
            return None;
        }
        if self.last_fix == Some(point) {
            return None;
        }
        self.last_fix = Some(point);
        Some(point)
    }

    pub fn start_tracker_pairing(&mut self) -> bool {
        match self.transact(OpCode::StartTrackerPair, &[]) {
            Some(d) => d.first() == Some(&0x01) && d.get(1) == Some(&0x01),
            None => false,
        }
    }

    /// Reports `(paired, pairing)` as flagged by the radio.
    pub fn check_tracker_pairing(&mut self) -> Option<PairStatus> {
        let d = self.transact(OpCode::CheckTrackerPair, &[])?;
        if d.first() != Some(&0x02) || d.len() < 3 {
            return None;
        }
        Some(PairStatus {
            paired: d[1] == 0x01,
            pairing: d[2] == 0x01,
        })
    }

    /// Cancel an ongoing pairing or forget the stored partner.
    pub fn cancel_tracker_pairing(&mut self) -> bool {
        match self.transact(OpCode::CancelTrackerPair, &[]) {
            Some(d) => d.get(1) == Some(&0x01),
            None => false,
        }
    }

    /// Power-cycle both servos. The caller must re-apply servo
    /// configuration afterwards.
    pub fn reboot_dynamixel(&mut self) -> Option<()> {
        self.transact(OpCode::RebootDynamixel, &[]).map(|_| ())
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
