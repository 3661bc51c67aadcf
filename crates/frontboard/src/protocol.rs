//! Wire framing for the front board link.
//!
//! Every frame, in both directions, has the shape
//!
//! ```text
//! 0xFF 0xFF | op | len_hi | len_lo | data[len_lo] | chk_hi | chk_lo
//! ```
//!
//! where `len_hi` is always zero (payloads cap at 255 bytes) and the
//! checksum is the 16-bit sum of every byte from the op code through the end
//! of the data, split big-endian.
//!
//! Servo register payloads carry the address as `(addr_hi, addr_lo)` and
//! 32-bit register values most-significant byte first; the board answers
//! with big-endian register values as well. The byte order is mandated by
//! the board firmware and must not change.

use std::io::Read;
use thiserror::Error;
use types::GeoPoint;

pub const PREAMBLE: [u8; 2] = [0xFF, 0xFF];

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("payload too long ({0} bytes, max 255)")]
    PayloadTooLong(usize),
    #[error("bad preamble {0:02X?}")]
    BadPreamble([u8; 2]),
    #[error("checksum mismatch (expected {expected:#06X}, got {got:#06X})")]
    ChecksumMismatch { expected: u16, got: u16 },
    #[error("truncated frame")]
    Truncated,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Operation codes understood by the board firmware.
///
/// Numeric values are part of the wire contract.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Firmware = 0x20,
    DynamixelWrite = 0x50,
    DynamixelRead = 0x51,
    GroupDynamixelWrite = 0x56,
    GroupDynamixelRead = 0x57,
    BulkDynamixelRead = 0x58,
    BulkTempRead = 0x59,
    SetShutdown = 0x60,
    GetShutdownState = 0x61,
    SetBackPanelLeds = 0x62,
    GetMac = 0x63,
    GetHallStatus = 0x64,
    GetTrackerMsg = 0x65,
    StartTrackerPair = 0x66,
    CheckTrackerPair = 0x67,
    CancelTrackerPair = 0x68,
    RebootDynamixel = 0x69,
}

/// Build a complete frame for `op` around `data`.
pub fn build_frame(op: OpCode, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if data.len() > 255 {
        return Err(ProtocolError::PayloadTooLong(data.len()));
    }
    let mut frame = Vec::with_capacity(7 + data.len());
    frame.extend_from_slice(&PREAMBLE);
    frame.push(op as u8);
    frame.push(0);
    frame.push(data.len() as u8);
    frame.extend_from_slice(data);
    let chk = checksum(&frame[2..]);
    frame.extend_from_slice(&chk.to_be_bytes());
    Ok(frame)
}

/// Sum of the op, length and data bytes, as the firmware computes it.
fn checksum(op_through_data: &[u8]) -> u16 {
    op_through_data
        .iter()
        .fold(0u16, |acc, &b| acc.wrapping_add(b as u16))
}

/// Read one frame from the port and return `(op, data)`.
///
/// Validates the preamble and the checksum; a mismatch discards the frame.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<(u8, Vec<u8>), ProtocolError> {
    let mut header = [0u8; 2];
    reader.read_exact(&mut header)?;
    if header != PREAMBLE {
        return Err(ProtocolError::BadPreamble(header));
    }

    let mut head = [0u8; 3];
    reader.read_exact(&mut head)?;
    let (op, len) = (head[0], head[2] as usize);

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;

    let mut chk = [0u8; 2];
    reader.read_exact(&mut chk)?;
    let got = u16::from_be_bytes(chk);

    let mut summed = head.to_vec();
    summed.extend_from_slice(&data);
    let expected = checksum(&summed);
    if expected != got {
        return Err(ProtocolError::ChecksumMismatch { expected, got });
    }

    Ok((op, data))
}

/// Parse a frame from a byte slice. Test and diagnostics helper; the live
/// link reads from the port directly.
pub fn parse_frame(raw: &[u8]) -> Result<(u8, Vec<u8>), ProtocolError> {
    let mut cursor = raw;
    let parsed = read_frame(&mut cursor)?;
    Ok(parsed)
}

/// One register write in a group command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupWriteEntry {
    pub id: u8,
    pub addr: u16,
    pub value: i32,
}

impl GroupWriteEntry {
    pub fn new(id: u8, addr: u16, value: i32) -> Self {
        Self { id, addr, value }
    }
}

/// Payload for a group write: `[N, (id, addr_hi, addr_lo, d3..d0) × N]`.
pub fn group_write_payload(entries: &[GroupWriteEntry]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + entries.len() * 7);
    payload.push(entries.len() as u8);
    for entry in entries {
        payload.push(entry.id);
        payload.extend_from_slice(&entry.addr.to_be_bytes());
        payload.extend_from_slice(&entry.value.to_be_bytes());
    }
    payload
}

/// Payload for a group read: `[N, (id, addr_hi, addr_lo) × N]`.
pub fn group_read_payload(queries: &[(u8, u16)]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + queries.len() * 3);
    payload.push(queries.len() as u8);
    for &(id, addr) in queries {
        payload.push(id);
        payload.extend_from_slice(&addr.to_be_bytes());
    }
    payload
}

/// Payload for a single register write.
pub fn register_write_payload(id: u8, addr: u16, value: i32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(7);
    payload.push(id);
    payload.extend_from_slice(&addr.to_be_bytes());
    payload.extend_from_slice(&value.to_be_bytes());
    payload
}

/// Payload for a single register read.
pub fn register_read_payload(id: u8, addr: u16) -> Vec<u8> {
    let mut payload = Vec::with_capacity(3);
    payload.push(id);
    payload.extend_from_slice(&addr.to_be_bytes());
    payload
}

/// Register value from a read response: the trailing 4 bytes, big-endian,
/// two's complement.
pub fn parse_register_value(data: &[u8]) -> Option<i32> {
    let tail = data.get(data.len().checked_sub(4)?..)?;
    Some(i32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]))
}

/// Tracker telemetry from an op 0x65 response: first byte is the payload
/// length; 8 means `lat:i32_le, lon:i32_le`, each scaled by 1e7.
pub fn decode_tracker_payload(data: &[u8]) -> Option<GeoPoint> {
    if data.first() != Some(&0x08) || data.len() < 9 {
        return None;
    }
    let lat = i32::from_le_bytes([data[1], data[2], data[3], data[4]]) as f64 / 1e7;
    let lon = i32::from_le_bytes([data[5], data[6], data[7], data[8]]) as f64 / 1e7;
    Some(GeoPoint::new(lat, lon))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_frame_golden() {
        let payload = [0x01, 0x00, 0x10, 0x00, 0x00, 0x00, 0x05];
        let frame = build_frame(OpCode::DynamixelWrite, &payload).unwrap();
        assert_eq!(
            frame,
            vec![0xFF, 0xFF, 0x50, 0x00, 0x07, 0x01, 0x00, 0x10, 0x00, 0x00, 0x00, 0x05, 0x00, 0x6D]
        );
    }

    #[test]
    fn test_build_then_parse_round_trips() {
        for (op, payload) in [
            (OpCode::Firmware, vec![]),
            (OpCode::SetBackPanelLeds, vec![0x03]),
            (OpCode::GroupDynamixelWrite, vec![0x01, 0x02, 0x00, 0x74, 0xFF, 0xFF, 0xFE, 0x0C]),
            (OpCode::GetTrackerMsg, (0..=255u8).collect::<Vec<_>>()[..200].to_vec()),
        ] {
            let frame = build_frame(op, &payload).unwrap();
            let (parsed_op, parsed) = parse_frame(&frame).unwrap();
            assert_eq!(parsed_op, op as u8);
            assert_eq!(parsed, payload);
        }
    }

    #[test]
    fn test_corrupted_checksum_rejected() {
        let mut frame = build_frame(OpCode::GetHallStatus, &[0x01]).unwrap();
        let last = frame.len() - 1;
        frame[last] = frame[last].wrapping_add(1);
        assert!(matches!(
            parse_frame(&frame),
            Err(ProtocolError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_bad_preamble_rejected() {
        let mut frame = build_frame(OpCode::GetHallStatus, &[]).unwrap();
        frame[0] = 0x00;
        assert!(matches!(
            parse_frame(&frame),
            Err(ProtocolError::BadPreamble(_))
        ));
    }

    #[test]
    fn test_payload_cap() {
        let big = vec![0u8; 256];
        assert!(matches!(
            build_frame(OpCode::Firmware, &big),
            Err(ProtocolError::PayloadTooLong(256))
        ));
    }

    #[test]
    fn test_register_payload_byte_order() {
        // Address 116 (0x0074) splits hi/lo; value -500 goes out MSB first.
        let payload = register_write_payload(2, 116, -500);
        assert_eq!(payload, vec![0x02, 0x00, 0x74, 0xFF, 0xFF, 0xFE, 0x0C]);
    }

    #[test]
    fn test_register_read_response_is_big_endian_signed() {
        // Responses carry id/error bytes before the value; only the trailing
        // four bytes are the register.
        let data = [0x02, 0x00, 0xFF, 0xFF, 0xFE, 0x0C];
        assert_eq!(parse_register_value(&data), Some(-500));
        assert_eq!(parse_register_value(&[0x00, 0x00, 0x08, 0x00]), Some(2048));
        assert_eq!(parse_register_value(&[0x01]), None);
    }

    #[test]
    fn test_group_write_payload_layout() {
        let entries = [
            GroupWriteEntry::new(1, 64, 1),
            GroupWriteEntry::new(2, 64, 1),
        ];
        let payload = group_write_payload(&entries);
        assert_eq!(payload.len(), 1 + 2 * 7);
        assert_eq!(payload[0], 2);
        assert_eq!(&payload[1..8], &[1, 0x00, 0x40, 0, 0, 0, 1]);
        assert_eq!(&payload[8..15], &[2, 0x00, 0x40, 0, 0, 0, 1]);
    }

    #[test]
    fn test_group_read_payload_layout() {
        let payload = group_read_payload(&[(2, 80), (2, 82), (2, 84)]);
        assert_eq!(payload, vec![3, 2, 0x00, 0x50, 2, 0x00, 0x52, 2, 0x00, 0x54]);
    }

    #[test]
    fn test_tracker_decode() {
        // 38.5, -9.2 scaled by 1e7, little-endian.
        let mut data = vec![0x08];
        data.extend_from_slice(&385_000_000i32.to_le_bytes());
        data.extend_from_slice(&(-92_000_000i32).to_le_bytes());
        let point = decode_tracker_payload(&data).unwrap();
        assert!((point.latitude - 38.5).abs() < 1e-9);
        assert!((point.longitude - -9.2).abs() < 1e-9);
    }

    #[test]
    fn test_tracker_decode_rejects_empty_report() {
        assert_eq!(decode_tracker_payload(&[0x00]), None);
        assert_eq!(decode_tracker_payload(&[]), None);
        // Length byte claims data that is not there.
        assert_eq!(decode_tracker_payload(&[0x08, 1, 2, 3]), None);
    }
}
