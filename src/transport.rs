//! BLE GATT transport abstraction.
//!
//! Provides a trait-based abstraction over the host's BLE stack, enabling
//! both real adapters and mock testing. Request/response style calls go
//! through [`GattClient`]; unsolicited link traffic (characteristic
//! notifications, disconnects) arrives as [`GattEvent`]s on a channel the
//! transport implementation feeds.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DfuResult;

// ============================================================================
// Identifiers and Discovery Results
// ============================================================================

/// Opaque identifier for a peripheral known to the host BLE stack.
///
/// The contents are whatever the platform uses to re-address a device
/// (a MAC address on Linux, a CoreBluetooth identifier on macOS).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        DeviceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A discovered GATT service and its characteristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

impl ServiceInfo {
    /// Check whether the service exposes the given characteristic.
    pub fn has_characteristic(&self, uuid: Uuid) -> bool {
        self.characteristics.contains(&uuid)
    }
}

// ============================================================================
// Link Events
// ============================================================================

/// Unsolicited events delivered by the transport.
///
/// The transport implementation sends these on the event channel handed to
/// the updater; they are the only path by which notifications and
/// disconnects reach the update engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    /// A characteristic notification arrived.
    Notification {
        device: DeviceId,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    /// The link to a device dropped, expectedly or not.
    Disconnected { device: DeviceId },
}

// ============================================================================
// GATT Client Trait
// ============================================================================

/// Trait for BLE GATT operations.
///
/// This abstraction allows mocking the BLE stack in tests and swapping
/// platform adapters without touching the update logic.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GattClient: Send + Sync {
    /// Connect to a peripheral.
    async fn connect(&self, device: &DeviceId) -> DfuResult<()>;

    /// Drop the connection to a peripheral.
    async fn disconnect(&self, device: &DeviceId) -> DfuResult<()>;

    /// Discover all services and characteristics on a connected peripheral.
    async fn discover_services(&self, device: &DeviceId) -> DfuResult<Vec<ServiceInfo>>;

    /// Read a characteristic value.
    async fn read_characteristic(&self, device: &DeviceId, characteristic: Uuid)
        -> DfuResult<Vec<u8>>;

    /// Write a characteristic and wait for the peripheral's acknowledgement.
    async fn write_characteristic(
        &self,
        device: &DeviceId,
        characteristic: Uuid,
        value: Vec<u8>,
    ) -> DfuResult<()>;

    /// Write a characteristic without waiting for an acknowledgement.
    ///
    /// Returns once the host stack has accepted the write for transmission.
    async fn write_characteristic_no_response(
        &self,
        device: &DeviceId,
        characteristic: Uuid,
        value: Vec<u8>,
    ) -> DfuResult<()>;

    /// Enable or disable notifications on a characteristic.
    async fn set_notifications(
        &self,
        device: &DeviceId,
        characteristic: Uuid,
        enable: bool,
    ) -> DfuResult<()>;

    /// Scan until a peripheral advertising one of the given services appears.
    ///
    /// # Arguments
    /// * `services` - Service UUIDs to filter advertisements on
    /// * `timeout` - Scan window; implementations return
    ///   `DfuError::DiscoveryTimeout` when it elapses without a match
    ///
    /// # Returns
    /// The identifier of the first matching peripheral
    async fn scan_for_service(&self, services: Vec<Uuid>, timeout: Duration)
        -> DfuResult<DeviceId>;
}

// ============================================================================
// Operation Queue
// ============================================================================

/// A GATT operation queued against the bootloader link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattOp {
    /// Subscribe to control point notifications.
    EnableNotifications,
    /// Acknowledged write to the control point characteristic.
    WriteControl(Vec<u8>),
    /// Unacknowledged write to the packet characteristic.
    WritePacket(Vec<u8>),
}

impl GattOp {
    pub fn kind(&self) -> GattOpKind {
        match self {
            GattOp::EnableNotifications => GattOpKind::EnableNotifications,
            GattOp::WriteControl(_) => GattOpKind::WriteControl,
            GattOp::WritePacket(_) => GattOpKind::WritePacket,
        }
    }
}

/// Payload-free tag for a [`GattOp`], used in completion reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattOpKind {
    EnableNotifications,
    WriteControl,
    WritePacket,
}

impl GattOpKind {
    /// Short name for watchdog and log messages.
    pub fn describe(&self) -> &'static str {
        match self {
            GattOpKind::EnableNotifications => "notification setup",
            GattOpKind::WriteControl => "control point write",
            GattOpKind::WritePacket => "packet write",
        }
    }
}

/// Completion report for a dispatched operation.
#[derive(Debug)]
pub struct OpOutcome {
    pub kind: GattOpKind,
    pub result: DfuResult<()>,
}

/// Serializes GATT operations against a link.
///
/// BLE stacks allow a single outstanding request per connection; issuing a
/// second write before the first completes gets it silently dropped on
/// several platforms. The queue holds ops until the line is idle and hands
/// out at most one at a time.
#[derive(Debug, Default)]
pub struct GattQueue {
    pending: VecDeque<GattOp>,
    in_flight: bool,
}

impl GattQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an operation. Returns it back when the line is idle, meaning
    /// the caller should dispatch it now.
    pub fn submit(&mut self, op: GattOp) -> Option<GattOp> {
        self.pending.push_back(op);
        if self.in_flight {
            None
        } else {
            self.in_flight = true;
            self.pending.pop_front()
        }
    }

    /// Record completion of the in-flight operation and get the next one
    /// to dispatch, if any.
    pub fn complete(&mut self) -> Option<GattOp> {
        match self.pending.pop_front() {
            Some(next) => Some(next),
            None => {
                self.in_flight = false;
                None
            }
        }
    }

    /// Drop all queued operations. The in-flight one, if any, still
    /// reports its completion through [`GattQueue::complete`].
    pub fn drain(&mut self) {
        self.pending.clear();
    }

    /// True when nothing is queued or in flight.
    pub fn is_idle(&self) -> bool {
        !self.in_flight && self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control(byte: u8) -> GattOp {
        GattOp::WriteControl(vec![byte])
    }

    #[test]
    fn test_queue_dispatches_immediately_when_idle() {
        let mut queue = GattQueue::new();
        assert!(queue.is_idle());

        let dispatched = queue.submit(control(0x01));
        assert_eq!(dispatched, Some(control(0x01)));
        assert!(!queue.is_idle());
    }

    #[test]
    fn test_queue_holds_ops_while_one_is_in_flight() {
        let mut queue = GattQueue::new();

        assert!(queue.submit(control(0x01)).is_some());
        assert!(queue.submit(control(0x02)).is_none());
        assert!(queue.submit(GattOp::WritePacket(vec![0xAA])).is_none());

        // Completions release queued ops in submission order
        assert_eq!(queue.complete(), Some(control(0x02)));
        assert_eq!(queue.complete(), Some(GattOp::WritePacket(vec![0xAA])));
        assert_eq!(queue.complete(), None);
        assert!(queue.is_idle());
    }

    #[test]
    fn test_queue_drain_drops_pending_only() {
        let mut queue = GattQueue::new();

        assert!(queue.submit(control(0x01)).is_some());
        assert!(queue.submit(control(0x02)).is_none());
        queue.drain();

        // The in-flight op still owes a completion; nothing follows it
        assert!(!queue.is_idle());
        assert_eq!(queue.complete(), None);
        assert!(queue.is_idle());
    }

    #[test]
    fn test_queue_spurious_complete_is_harmless() {
        let mut queue = GattQueue::new();
        assert_eq!(queue.complete(), None);
        assert!(queue.is_idle());

        let dispatched = queue.submit(control(0x03));
        assert_eq!(dispatched, Some(control(0x03)));
    }

    #[test]
    fn test_op_kind_mapping() {
        assert_eq!(
            GattOp::EnableNotifications.kind(),
            GattOpKind::EnableNotifications
        );
        assert_eq!(control(0x01).kind(), GattOpKind::WriteControl);
        assert_eq!(
            GattOp::WritePacket(vec![]).kind(),
            GattOpKind::WritePacket
        );
    }
}
