//! Wire framing for the RigDfu control point and packet characteristics.
//!
//! Control point writes carry bare opcodes; any data belonging to a command
//! (size frames, init packets, image bytes) travels separately over the
//! packet characteristic. The bootloader talks back through control point
//! notifications, parsed here into [`ControlNotification`].

// Allow unused items - builders cover the full command set including
// commands an embedder may drive directly (system reset, legacy erase).
#![allow(dead_code)]

use crate::config::{DfuOpcode, DfuResponseStatus, PACKET_SIZE};
use crate::error::{DfuError, DfuResult};

// ============================================================================
// Control Point Frame Builders
// ============================================================================

/// Build a bare-opcode control point frame.
pub fn build_opcode_frame(opcode: DfuOpcode) -> Vec<u8> {
    vec![opcode as u8]
}

/// Build the packet receipt configuration frame.
///
/// Format: `[0x08, interval_lo, interval_hi]`. The bootloader sends a
/// receipt notification after every `interval` image packets.
pub fn build_receipt_interval_frame(interval: u16) -> Vec<u8> {
    let bytes = interval.to_le_bytes();
    vec![
        DfuOpcode::PacketReceiptNotifyRequest as u8,
        bytes[0],
        bytes[1],
    ]
}

// ============================================================================
// Payload Chunking
// ============================================================================

/// Number of packets needed to stream `payload_len` bytes.
///
/// All packets carry [`PACKET_SIZE`] bytes except a shorter final packet
/// when the payload is not a multiple of it.
pub fn chunk_count(payload_len: usize) -> usize {
    (payload_len + PACKET_SIZE - 1) / PACKET_SIZE
}

/// The `index`-th packet of a payload, or `None` past the end.
pub fn chunk_at(payload: &[u8], index: usize) -> Option<&[u8]> {
    let start = index.checked_mul(PACKET_SIZE)?;
    if start >= payload.len() {
        return None;
    }
    let end = (start + PACKET_SIZE).min(payload.len());
    Some(&payload[start..end])
}

// ============================================================================
// Control Point Notification Parsing
// ============================================================================

/// A parsed control point notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlNotification {
    /// Command response: the echoed request opcode and its outcome.
    Response {
        request: DfuOpcode,
        status: DfuResponseStatus,
    },
    /// Cumulative count of image bytes the bootloader has received.
    PacketReceipt { bytes_received: u32 },
}

/// Parse a raw control point notification.
///
/// Response format: `[0x10, request_opcode, status]`.
/// Receipt format: `[0x11, count_le(4)]`.
///
/// # Arguments
/// * `data` - Notification bytes as delivered by the transport
///
/// # Returns
/// The parsed notification, or an error for frames this protocol does not
/// define (callers log and ignore those)
pub fn parse_notification(data: &[u8]) -> DfuResult<ControlNotification> {
    match data.first().copied() {
        Some(op) if op == DfuOpcode::Response as u8 => {
            if data.len() < 3 {
                return Err(DfuError::transport(format!(
                    "truncated response notification: {:02X?}",
                    data
                )));
            }
            let request = DfuOpcode::from_byte(data[1]).ok_or_else(|| {
                DfuError::transport(format!("response echoes unknown opcode 0x{:02X}", data[1]))
            })?;
            let status = DfuResponseStatus::from_byte(data[2]).ok_or_else(|| {
                DfuError::transport(format!("response carries unknown status 0x{:02X}", data[2]))
            })?;
            Ok(ControlNotification::Response { request, status })
        }
        Some(op) if op == DfuOpcode::PacketReceipt as u8 => {
            if data.len() < 5 {
                return Err(DfuError::transport(format!(
                    "truncated packet receipt notification: {:02X?}",
                    data
                )));
            }
            let bytes_received = u32::from_le_bytes([data[1], data[2], data[3], data[4]]);
            Ok(ControlNotification::PacketReceipt { bytes_received })
        }
        Some(op) => Err(DfuError::transport(format!(
            "unrecognized control point notification opcode 0x{:02X}",
            op
        ))),
        None => Err(DfuError::transport("empty control point notification")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_opcode_frame() {
        assert_eq!(build_opcode_frame(DfuOpcode::Start), vec![0x01]);
        assert_eq!(
            build_opcode_frame(DfuOpcode::ActivateFirmwareImage),
            vec![0x05]
        );
        assert_eq!(build_opcode_frame(DfuOpcode::SystemReset), vec![0x06]);
    }

    #[test]
    fn test_build_receipt_interval_frame() {
        assert_eq!(build_receipt_interval_frame(1), vec![0x08, 0x01, 0x00]);
        assert_eq!(build_receipt_interval_frame(0x0204), vec![0x08, 0x04, 0x02]);
    }

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0), 0);
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(20), 1);
        assert_eq!(chunk_count(21), 2);
        assert_eq!(chunk_count(41), 3);
        assert_eq!(chunk_count(1000), 50);
    }

    #[test]
    fn test_chunks_cover_payload_exactly() {
        for len in 1..=100 {
            let payload: Vec<u8> = (0..len as u8).collect();
            let count = chunk_count(len);

            let mut total = 0;
            for index in 0..count {
                let chunk = chunk_at(&payload, index).unwrap();
                if index + 1 < count {
                    assert_eq!(chunk.len(), PACKET_SIZE, "non-final chunk at len {}", len);
                }
                total += chunk.len();
            }
            assert_eq!(total, len);
            assert!(chunk_at(&payload, count).is_none());
        }
    }

    #[test]
    fn test_chunk_at_splits_41_bytes() {
        let payload = vec![0x55; 41];
        assert_eq!(chunk_at(&payload, 0).unwrap().len(), 20);
        assert_eq!(chunk_at(&payload, 1).unwrap().len(), 20);
        assert_eq!(chunk_at(&payload, 2).unwrap().len(), 1);
        assert!(chunk_at(&payload, 3).is_none());
    }

    #[test]
    fn test_parse_response_notification() {
        let parsed = parse_notification(&[0x10, 0x01, 0x01]).unwrap();
        assert_eq!(
            parsed,
            ControlNotification::Response {
                request: DfuOpcode::Start,
                status: DfuResponseStatus::Success,
            }
        );

        let parsed = parse_notification(&[0x10, 0x03, 0x06]).unwrap();
        assert_eq!(
            parsed,
            ControlNotification::Response {
                request: DfuOpcode::ReceiveFirmwareImage,
                status: DfuResponseStatus::OperationFailed,
            }
        );
    }

    #[test]
    fn test_parse_packet_receipt_notification() {
        let parsed = parse_notification(&[0x11, 0xE8, 0x03, 0x00, 0x00]).unwrap();
        assert_eq!(
            parsed,
            ControlNotification::PacketReceipt {
                bytes_received: 1000
            }
        );
    }

    #[test]
    fn test_parse_rejects_malformed_notifications() {
        assert!(parse_notification(&[]).is_err());
        assert!(parse_notification(&[0x60, 0x01]).is_err());
        assert!(parse_notification(&[0x10, 0x01]).is_err());
        assert!(parse_notification(&[0x10, 0xAA, 0x01]).is_err());
        assert!(parse_notification(&[0x10, 0x01, 0xAA]).is_err());
        assert!(parse_notification(&[0x11, 0x01, 0x02]).is_err());
    }
}
