//! Error types for the RigDfu update engine.

// Allow unused variants/methods - these are part of the error API surface
// and may be used for better error handling in the future.
#![allow(dead_code)]

use thiserror::Error;

/// Result type alias for DFU operations.
pub type DfuResult<T> = Result<T, DfuError>;

/// Errors that can occur during a firmware update.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DfuError {
    /// The connected peripheral is in a state the update cannot proceed from.
    #[error("Peripheral is in an invalid state for updating")]
    BadPeripheral,

    /// Bootloader service found but its control point characteristic is missing.
    #[error("DFU control point characteristic not available")]
    ControlPointMissing,

    /// The discovered device does not expose a usable bootloader service.
    #[error("Device does not provide a DFU service")]
    BadDevice,

    /// No target device was supplied in the update request.
    #[error("Update peripheral is not set")]
    PeripheralNotSet,

    /// An update request parameter is invalid.
    #[error("Invalid update parameter: {reason}")]
    InvalidParameter { reason: String },

    /// The bootloader rejected the transferred image during validation.
    #[error("Firmware image validation failed")]
    ImageValidationFailure,

    /// The bootloader failed to activate the validated image.
    #[error("Firmware image activation failed")]
    ImageActivationFailure,

    /// The patch does not apply to the firmware currently on the device.
    #[error("Patch does not match the firmware on the device")]
    PatchCrcMismatch,

    /// The patched image failed its post-application CRC check.
    #[error("Patched firmware image failed validation")]
    PostPatchCrcMismatch,

    /// The bootloader could not be connected to after discovery.
    #[error("Could not connect to the bootloader")]
    CouldNotConnect,

    /// Unclassified failure.
    #[error("Unknown DFU failure")]
    Unknown,

    /// The transport reported a connection failure.
    #[error("Connection failed: {reason}")]
    ConnectionFailed { reason: String },

    /// Connecting to the bootloader did not complete in time.
    #[error("Timed out connecting to the bootloader")]
    ConnectionTimeout,

    /// No bootloader was discovered within the scan window.
    #[error("Bootloader not discovered within {timeout_ms}ms")]
    DiscoveryTimeout { timeout_ms: u64 },

    /// Writing the patch-init header was rejected by the bootloader.
    #[error("Bootloader rejected the patch initialization data")]
    PatchInitWriteFailure,

    /// Writing the validation command failed at the transport level.
    #[error("Failed to request image validation")]
    ValidationWriteFailure,

    /// The bootloader link dropped in the middle of the update.
    #[error("Bootloader disconnected during the update")]
    BootloaderDisconnect,

    /// The update was cancelled on request.
    #[error("Update cancelled")]
    UpdateCancelled,

    /// Another update is already running on this updater.
    #[error("An update is already in progress")]
    UpdateInProgress,

    /// A GATT operation exceeded the per-operation watchdog.
    #[error("Timed out waiting for {operation}")]
    OperationTimeout { operation: String },

    /// Error surfaced by the GATT transport implementation.
    #[error("Transport error: {message}")]
    Transport { message: String },
}

impl DfuError {
    /// Wrap a transport-layer error message.
    pub fn transport(message: impl Into<String>) -> Self {
        DfuError::Transport {
            message: message.into(),
        }
    }

    /// Build an invalid-parameter error with a reason.
    pub fn invalid_parameter(reason: impl Into<String>) -> Self {
        DfuError::InvalidParameter {
            reason: reason.into(),
        }
    }

    /// Check whether this error reports an explicit cancellation rather
    /// than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, DfuError::UpdateCancelled)
    }

    /// Get the stable numeric code for this error.
    ///
    /// Codes are carried in `Failed` reports so embedders can branch on
    /// failures without string matching.
    pub fn error_code(&self) -> i32 {
        match self {
            DfuError::BadPeripheral => -1,
            DfuError::ControlPointMissing => -2,
            DfuError::BadDevice => -3,
            DfuError::PeripheralNotSet => -4,
            DfuError::InvalidParameter { .. } => -5,
            DfuError::ImageValidationFailure => -6,
            DfuError::ImageActivationFailure => -7,
            DfuError::PatchCrcMismatch => -8,
            DfuError::PostPatchCrcMismatch => -9,
            DfuError::CouldNotConnect => -10,
            DfuError::Unknown => -11,
            DfuError::ConnectionFailed { .. } => -30,
            DfuError::ConnectionTimeout => -31,
            DfuError::DiscoveryTimeout { .. } => -32,
            DfuError::PatchInitWriteFailure => -33,
            DfuError::ValidationWriteFailure => -34,
            DfuError::BootloaderDisconnect => -35,
            DfuError::UpdateCancelled => -36,
            DfuError::UpdateInProgress => -37,
            DfuError::OperationTimeout { .. } => -38,
            DfuError::Transport { .. } => -39,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(DfuError::BadPeripheral.error_code(), -1);
        assert_eq!(DfuError::PatchCrcMismatch.error_code(), -8);
        assert_eq!(DfuError::BootloaderDisconnect.error_code(), -35);
        assert_eq!(DfuError::transport("hci down").error_code(), -39);
    }

    #[test]
    fn test_is_cancellation() {
        assert!(DfuError::UpdateCancelled.is_cancellation());
        assert!(!DfuError::BootloaderDisconnect.is_cancellation());
        assert!(!DfuError::Unknown.is_cancellation());
    }

    #[test]
    fn test_error_messages() {
        let err = DfuError::invalid_parameter("image shorter than 16 bytes");
        assert_eq!(
            err.to_string(),
            "Invalid update parameter: image shorter than 16 bytes"
        );

        let err = DfuError::DiscoveryTimeout { timeout_ms: 30_000 };
        assert_eq!(err.to_string(), "Bootloader not discovered within 30000ms");
    }
}
