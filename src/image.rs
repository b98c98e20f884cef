//! Firmware image parsing and transfer layout.
//!
//! An update starts from one opaque byte buffer whose on-the-wire layout
//! depends on the target bootloader:
//! - Legacy: the whole buffer is the streamed payload.
//! - Secure: 12-byte start packet + 32-byte init packet, then the payload.
//! - Secure patch: 16-byte patch marker, then start and init packets as for
//!   secure images, a 12-byte patch-init header, then the patch payload.
//!
//! Parsing detects patchness up front; the final layout is only known once
//! the target's bootloader type has been read off the device.

use crate::config::{
    INIT_PACKET_HALF_SIZE, PATCH_INIT_PACKET_SIZE, PATCH_MARKER, SECURE_HEADER_SIZE,
    START_PACKET_SIZE,
};
use crate::error::{DfuError, DfuResult};

/// Image layout variants understood by the bootloaders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageVariant {
    /// Unsigned image for legacy bootloaders.
    Legacy,
    /// Signed image for secure bootloaders.
    Secure,
    /// Signed delta patch for secure bootloaders.
    SecurePatch,
}

impl ImageVariant {
    /// Get a human-readable description for status reporting.
    pub fn description(&self) -> &'static str {
        match self {
            ImageVariant::Legacy => "unsigned firmware image",
            ImageVariant::Secure => "signed firmware image",
            ImageVariant::SecurePatch => "signed firmware patch",
        }
    }
}

/// A parsed firmware image, marker stripped, layout not yet resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
    patch: bool,
}

impl FirmwareImage {
    /// Parse an image buffer and detect whether it is a patch.
    ///
    /// The 16-byte patch marker, when present, is stripped here; all offsets
    /// elsewhere are relative to the stripped data. Buffers too short to
    /// hold a marker are rejected before any radio traffic happens.
    ///
    /// # Arguments
    /// * `bytes` - Raw image bytes as handed to the updater
    ///
    /// # Returns
    /// The parsed image, or `InvalidParameter` for undersized input
    pub fn parse(bytes: Vec<u8>) -> DfuResult<Self> {
        if bytes.len() < PATCH_MARKER.len() {
            return Err(DfuError::invalid_parameter(format!(
                "image is {} bytes, shorter than the {}-byte minimum",
                bytes.len(),
                PATCH_MARKER.len()
            )));
        }

        if bytes[..PATCH_MARKER.len()] == PATCH_MARKER {
            Ok(FirmwareImage {
                data: bytes[PATCH_MARKER.len()..].to_vec(),
                patch: true,
            })
        } else {
            Ok(FirmwareImage {
                data: bytes,
                patch: false,
            })
        }
    }

    /// Whether the image carried the patch marker.
    pub fn is_patch(&self) -> bool {
        self.patch
    }

    /// Image size after marker stripping.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when no image bytes remain after marker stripping.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A firmware image bound to a resolved layout, ready for streaming.
#[derive(Debug)]
pub struct ImageTransfer {
    data: Vec<u8>,
    variant: ImageVariant,
}

impl ImageTransfer {
    /// Bind an image to the bootloader type discovered on the device.
    ///
    /// # Arguments
    /// * `image` - Parsed firmware image
    /// * `secure` - Whether the target runs a secure bootloader
    ///
    /// # Returns
    /// The streamable transfer, or `InvalidParameter` when the image does
    /// not fit the bootloader (patch on a legacy bootloader, or a header
    /// larger than the image itself)
    pub fn new(image: FirmwareImage, secure: bool) -> DfuResult<Self> {
        let variant = match (image.patch, secure) {
            (true, true) => ImageVariant::SecurePatch,
            (true, false) => {
                return Err(DfuError::invalid_parameter(
                    "patch images require a secure bootloader",
                ));
            }
            (false, true) => ImageVariant::Secure,
            (false, false) => ImageVariant::Legacy,
        };

        let header_len = match variant {
            ImageVariant::Legacy => 0,
            ImageVariant::Secure => SECURE_HEADER_SIZE,
            ImageVariant::SecurePatch => SECURE_HEADER_SIZE + PATCH_INIT_PACKET_SIZE,
        };
        if image.data.len() <= header_len {
            return Err(DfuError::invalid_parameter(format!(
                "image is {} bytes but its header alone is {} bytes",
                image.data.len(),
                header_len
            )));
        }

        Ok(ImageTransfer {
            data: image.data,
            variant,
        })
    }

    /// The resolved layout variant.
    pub fn variant(&self) -> ImageVariant {
        self.variant
    }

    /// Frame written to the packet characteristic after the start opcode.
    ///
    /// Legacy bootloaders take the payload size as a little-endian u32;
    /// secure bootloaders take the image's own start packet verbatim.
    pub fn start_frame(&self) -> Vec<u8> {
        match self.variant {
            ImageVariant::Legacy => (self.payload_size() as u32).to_le_bytes().to_vec(),
            ImageVariant::Secure | ImageVariant::SecurePatch => {
                self.data[..START_PACKET_SIZE].to_vec()
            }
        }
    }

    /// The two 16-byte halves of the signed init packet (secure layouts).
    pub fn init_halves(&self) -> Option<(&[u8], &[u8])> {
        match self.variant {
            ImageVariant::Legacy => None,
            ImageVariant::Secure | ImageVariant::SecurePatch => {
                let first = &self.data[START_PACKET_SIZE..START_PACKET_SIZE + INIT_PACKET_HALF_SIZE];
                let second =
                    &self.data[START_PACKET_SIZE + INIT_PACKET_HALF_SIZE..SECURE_HEADER_SIZE];
                Some((first, second))
            }
        }
    }

    /// The 12-byte patch-init header (patch layout only).
    pub fn patch_init_block(&self) -> Option<&[u8]> {
        match self.variant {
            ImageVariant::SecurePatch => {
                Some(&self.data[SECURE_HEADER_SIZE..SECURE_HEADER_SIZE + PATCH_INIT_PACKET_SIZE])
            }
            _ => None,
        }
    }

    /// The bytes streamed over the packet characteristic.
    pub fn payload(&self) -> &[u8] {
        match self.variant {
            ImageVariant::Legacy => &self.data,
            ImageVariant::Secure => &self.data[SECURE_HEADER_SIZE..],
            ImageVariant::SecurePatch => {
                &self.data[SECURE_HEADER_SIZE + PATCH_INIT_PACKET_SIZE..]
            }
        }
    }

    /// Number of payload bytes to stream. Progress is reported against this.
    pub fn payload_size(&self) -> usize {
        self.payload().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a secure-layout image: identifiable header bytes then payload.
    fn secure_bytes(payload_len: usize) -> Vec<u8> {
        let mut bytes: Vec<u8> = (0..SECURE_HEADER_SIZE as u8).collect();
        bytes.extend(std::iter::repeat(0xAB).take(payload_len));
        bytes
    }

    fn patch_bytes(payload_len: usize) -> Vec<u8> {
        let mut bytes = PATCH_MARKER.to_vec();
        bytes.extend(0..(SECURE_HEADER_SIZE + PATCH_INIT_PACKET_SIZE) as u8);
        bytes.extend(std::iter::repeat(0xCD).take(payload_len));
        bytes
    }

    #[test]
    fn test_parse_rejects_undersized_image() {
        let result = FirmwareImage::parse(vec![0x00; 15]);
        assert!(matches!(result, Err(DfuError::InvalidParameter { .. })));
    }

    #[test]
    fn test_parse_full_image() {
        let image = FirmwareImage::parse(vec![0x42; 100]).unwrap();
        assert!(!image.is_patch());
        assert_eq!(image.len(), 100);
    }

    #[test]
    fn test_parse_strips_patch_marker() {
        let image = FirmwareImage::parse(patch_bytes(10)).unwrap();
        assert!(image.is_patch());
        assert_eq!(image.len(), SECURE_HEADER_SIZE + PATCH_INIT_PACKET_SIZE + 10);
    }

    #[test]
    fn test_parse_is_deterministic() {
        let bytes = patch_bytes(25);
        let first = FirmwareImage::parse(bytes.clone()).unwrap();
        let second = FirmwareImage::parse(bytes).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_legacy_layout() {
        let image = FirmwareImage::parse(vec![0x42; 100]).unwrap();
        let transfer = ImageTransfer::new(image, false).unwrap();

        assert_eq!(transfer.variant(), ImageVariant::Legacy);
        assert_eq!(transfer.payload_size(), 100);
        assert_eq!(transfer.start_frame(), vec![100, 0, 0, 0]);
        assert!(transfer.init_halves().is_none());
        assert!(transfer.patch_init_block().is_none());
    }

    #[test]
    fn test_secure_layout() {
        let image = FirmwareImage::parse(secure_bytes(60)).unwrap();
        let transfer = ImageTransfer::new(image, true).unwrap();

        assert_eq!(transfer.variant(), ImageVariant::Secure);
        assert_eq!(transfer.start_frame().len(), START_PACKET_SIZE);
        assert_eq!(transfer.start_frame()[0], 0);
        assert_eq!(transfer.start_frame()[11], 11);

        let (first, second) = transfer.init_halves().unwrap();
        assert_eq!(first.len(), INIT_PACKET_HALF_SIZE);
        assert_eq!(second.len(), INIT_PACKET_HALF_SIZE);
        assert_eq!(first[0], 12);
        assert_eq!(second[0], 28);

        assert_eq!(transfer.payload_size(), 60);
        assert!(transfer.payload().iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_patch_layout() {
        let image = FirmwareImage::parse(patch_bytes(41)).unwrap();
        let transfer = ImageTransfer::new(image, true).unwrap();

        assert_eq!(transfer.variant(), ImageVariant::SecurePatch);
        let patch_init = transfer.patch_init_block().unwrap();
        assert_eq!(patch_init.len(), PATCH_INIT_PACKET_SIZE);
        assert_eq!(patch_init[0], SECURE_HEADER_SIZE as u8);

        assert_eq!(transfer.payload_size(), 41);
        assert!(transfer.payload().iter().all(|&b| b == 0xCD));
    }

    #[test]
    fn test_patch_requires_secure_bootloader() {
        let image = FirmwareImage::parse(patch_bytes(10)).unwrap();
        let result = ImageTransfer::new(image, false);
        assert!(matches!(result, Err(DfuError::InvalidParameter { .. })));
    }

    #[test]
    fn test_secure_image_must_exceed_header() {
        // 44 header bytes and nothing to stream
        let image = FirmwareImage::parse(secure_bytes(0)).unwrap();
        let result = ImageTransfer::new(image, true);
        assert!(matches!(result, Err(DfuError::InvalidParameter { .. })));
    }
}
