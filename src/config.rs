//! Protocol constants for the RigDfu BLE bootloader.

// Allow unused items - these cover the full bootloader wire protocol and may
// be used by embedders (e.g. legacy erase support, firmware revision reads).
#![allow(dead_code)]

use std::time::Duration;

use uuid::Uuid;

// ============================================================================
// Bootloader GATT Service Families
// ============================================================================

/// A DFU service UUID triple for one bootloader module family.
///
/// Two module generations ship the same protocol under different UUIDs.
/// Both are matched wherever a bootloader service is looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DfuServiceFamily {
    /// The vendor-specific DFU service.
    pub service: Uuid,
    /// Control point characteristic (opcode writes, response notifications).
    pub control_point: Uuid,
    /// Packet characteristic (raw image byte stream, write-only).
    pub packet: Uuid,
}

/// First-generation module family (`0000153x` base).
pub const DFU_FAMILY_153X: DfuServiceFamily = DfuServiceFamily {
    service: Uuid::from_u128(0x00001530_1212_efde_1523_785feabcd123),
    control_point: Uuid::from_u128(0x00001531_1212_efde_1523_785feabcd123),
    packet: Uuid::from_u128(0x00001532_1212_efde_1523_785feabcd123),
};

/// Second-generation module family (`41c8903x` base).
pub const DFU_FAMILY_41C8: DfuServiceFamily = DfuServiceFamily {
    service: Uuid::from_u128(0x41c89030_1756_4c30_93cc_a8fcc2fb0202),
    control_point: Uuid::from_u128(0x41c89031_1756_4c30_93cc_a8fcc2fb0202),
    packet: Uuid::from_u128(0x41c89032_1756_4c30_93cc_a8fcc2fb0202),
};

/// All recognized bootloader families, in match order.
pub const DFU_FAMILIES: [DfuServiceFamily; 2] = [DFU_FAMILY_153X, DFU_FAMILY_41C8];

/// Look up the bootloader family owning the given service UUID.
pub fn find_dfu_family(service: Uuid) -> Option<&'static DfuServiceFamily> {
    DFU_FAMILIES.iter().find(|f| f.service == service)
}

/// Service UUIDs to filter bootloader scans on.
pub fn dfu_service_uuids() -> [Uuid; 2] {
    [DFU_FAMILY_153X.service, DFU_FAMILY_41C8.service]
}

// ============================================================================
// Device Information Service
// ============================================================================

/// Device Information Service (standard 16-bit base).
pub const DIS_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);

/// Model Number String characteristic.
pub const DIS_MODEL_NUMBER_UUID: Uuid = Uuid::from_u128(0x00002a24_0000_1000_8000_00805f9b34fb);

/// Firmware Revision String characteristic.
pub const DIS_FIRMWARE_REVISION_UUID: Uuid =
    Uuid::from_u128(0x00002a27_0000_1000_8000_00805f9b34fb);

/// Model number string reported by secure bootloaders.
///
/// A bootloader advertising any other model string (or no Device Information
/// Service at all) speaks the legacy unsigned-image protocol.
pub const SECURE_DFU_MODEL_NUMBER: &str = "Rigado Secure DFU";

// ============================================================================
// Image Framing
// ============================================================================

/// Fixed size of every streamed image packet except possibly the last.
pub const PACKET_SIZE: usize = 20;

/// Size of the start packet header at the front of a secure image.
pub const START_PACKET_SIZE: usize = 12;

/// Size of the signed init packet following the start packet.
pub const INIT_PACKET_SIZE: usize = 32;

/// The init packet is transmitted as two halves of this size.
pub const INIT_PACKET_HALF_SIZE: usize = INIT_PACKET_SIZE / 2;

/// Size of the patch-init header (patch images only).
pub const PATCH_INIT_PACKET_SIZE: usize = 12;

/// Total header bytes preceding the payload of a secure image.
pub const SECURE_HEADER_SIZE: usize = START_PACKET_SIZE + INIT_PACKET_SIZE;

/// Marker prefix identifying a patch image. Stripped before layout
/// computation; the bytes that follow are laid out like a secure image
/// plus a patch-init header.
pub const PATCH_MARKER: [u8; 16] = *b"RIGADO-PATCH-IMG";

/// Packet receipt interval requested from the bootloader (receipt after
/// every packet).
pub const RECEIPT_INTERVAL: u16 = 1;

// ============================================================================
// Timing
// ============================================================================

/// Settle delay between the two init packet halves.
pub const INIT_HALF_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Settle delay between the activation write completing and the final
/// completion report, covering the bootloader's internal swap.
pub const ACTIVATE_SETTLE_DELAY: Duration = Duration::from_millis(2000);

/// Timeout for connecting to a freshly discovered bootloader.
pub const BOOTLOADER_CONNECT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Timeout for reconnect attempts after an unexpected bootloader drop.
pub const RECONNECT_TIMEOUT: Duration = Duration::from_millis(20_000);

/// Default bound on the bootloader discovery scan.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Default watchdog applied to each GATT operation.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(10_000);

// ============================================================================
// DFU Opcodes
// ============================================================================

/// Control point opcodes.
///
/// Outbound opcodes are written as single bytes (payloads travel on the
/// packet characteristic); `Response` and `PacketReceipt` are the wire
/// opcodes of inbound notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuOpcode {
    /// Begin an update; size information follows on the packet characteristic
    Start = 0x01,
    /// Announce the signed init packet (secure images)
    Init = 0x02,
    /// Begin streaming the firmware image
    ReceiveFirmwareImage = 0x03,
    /// Validate the transferred image
    ValidateFirmwareImage = 0x04,
    /// Swap in the validated image and reboot
    ActivateFirmwareImage = 0x05,
    /// Reboot without activating
    SystemReset = 0x06,
    /// Configure packet receipt notification interval
    PacketReceiptNotifyRequest = 0x08,
    /// Erase the application bank and reboot (legacy bootloaders only)
    EraseAndReset = 0x09,
    /// Announce the patch-init header (patch images)
    InitializePatch = 0x0A,
    /// Begin streaming a patch image
    ReceivePatchImage = 0x0B,
    /// Inbound: command response notification
    Response = 0x10,
    /// Inbound: cumulative-bytes receipt notification
    PacketReceipt = 0x11,
}

impl DfuOpcode {
    /// Parse an opcode from a byte value.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(DfuOpcode::Start),
            0x02 => Some(DfuOpcode::Init),
            0x03 => Some(DfuOpcode::ReceiveFirmwareImage),
            0x04 => Some(DfuOpcode::ValidateFirmwareImage),
            0x05 => Some(DfuOpcode::ActivateFirmwareImage),
            0x06 => Some(DfuOpcode::SystemReset),
            0x08 => Some(DfuOpcode::PacketReceiptNotifyRequest),
            0x09 => Some(DfuOpcode::EraseAndReset),
            0x0A => Some(DfuOpcode::InitializePatch),
            0x0B => Some(DfuOpcode::ReceivePatchImage),
            0x10 => Some(DfuOpcode::Response),
            0x11 => Some(DfuOpcode::PacketReceipt),
            _ => None,
        }
    }
}

/// Status codes carried in `Response` notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuResponseStatus {
    Success = 0x01,
    InvalidState = 0x02,
    NotSupported = 0x03,
    DataSizeExceedsLimit = 0x04,
    CrcError = 0x05,
    OperationFailed = 0x06,
    /// Patch stream wants the next packet (patch transfer flow control).
    PatchNeedMoreData = 0x07,
    /// Patch stream cannot accept more input.
    PatchInputFull = 0x08,
}

impl DfuResponseStatus {
    /// Parse a status code from a byte value.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(DfuResponseStatus::Success),
            0x02 => Some(DfuResponseStatus::InvalidState),
            0x03 => Some(DfuResponseStatus::NotSupported),
            0x04 => Some(DfuResponseStatus::DataSizeExceedsLimit),
            0x05 => Some(DfuResponseStatus::CrcError),
            0x06 => Some(DfuResponseStatus::OperationFailed),
            0x07 => Some(DfuResponseStatus::PatchNeedMoreData),
            0x08 => Some(DfuResponseStatus::PatchInputFull),
            _ => None,
        }
    }

    /// Get a human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            DfuResponseStatus::Success => "Operation successful",
            DfuResponseStatus::InvalidState => "Invalid state for this operation",
            DfuResponseStatus::NotSupported => "Operation not supported",
            DfuResponseStatus::DataSizeExceedsLimit => "Data size exceeds limit",
            DfuResponseStatus::CrcError => "CRC validation failed",
            DfuResponseStatus::OperationFailed => "Operation failed",
            DfuResponseStatus::PatchNeedMoreData => "Patch stream expects more data",
            DfuResponseStatus::PatchInputFull => "Patch input buffer is full",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_dfu_family() {
        let family = find_dfu_family(DFU_FAMILY_153X.service).unwrap();
        assert_eq!(family.control_point, DFU_FAMILY_153X.control_point);

        let family = find_dfu_family(DFU_FAMILY_41C8.service).unwrap();
        assert_eq!(family.packet, DFU_FAMILY_41C8.packet);

        assert!(find_dfu_family(DIS_SERVICE_UUID).is_none());
    }

    #[test]
    fn test_opcode_from_byte() {
        assert_eq!(DfuOpcode::from_byte(0x01), Some(DfuOpcode::Start));
        assert_eq!(DfuOpcode::from_byte(0x0A), Some(DfuOpcode::InitializePatch));
        assert_eq!(DfuOpcode::from_byte(0x11), Some(DfuOpcode::PacketReceipt));
        // 0x07 (report image size) is not part of this bootloader's protocol
        assert_eq!(DfuOpcode::from_byte(0x07), None);
        assert_eq!(DfuOpcode::from_byte(0xFF), None);
    }

    #[test]
    fn test_status_from_byte() {
        assert_eq!(
            DfuResponseStatus::from_byte(0x01),
            Some(DfuResponseStatus::Success)
        );
        assert_eq!(
            DfuResponseStatus::from_byte(0x07),
            Some(DfuResponseStatus::PatchNeedMoreData)
        );
        assert_eq!(DfuResponseStatus::from_byte(0x00), None);
        assert_eq!(DfuResponseStatus::from_byte(0x09), None);
    }

    #[test]
    fn test_patch_marker_length() {
        assert_eq!(PATCH_MARKER.len(), 16);
        assert_eq!(SECURE_HEADER_SIZE, 44);
    }
}
