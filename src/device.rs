//! Bootloader connection management.
//!
//! An update targets a device that is usually running its application
//! firmware, not the bootloader. Getting from one to the other takes a
//! small dance:
//! 1. If the device already exposes a DFU service, use it as-is
//! 2. Otherwise write the application's bootloader entry command, let the
//!    device reboot, and scan for the bootloader advertisement
//! 3. Connect to the bootloader and resolve its control point and packet
//!    characteristics
//!
//! While the update runs, the embedder's own connection handling is parked
//! behind an [`ObserverLease`] and restored when the updater lets go.

use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::{dfu_service_uuids, find_dfu_family, DIS_MODEL_NUMBER_UUID, DIS_SERVICE_UUID};
use crate::error::{DfuError, DfuResult};
use crate::transport::{DeviceId, GattClient, GattEvent};

// ============================================================================
// Bootloader Link
// ============================================================================

/// A connected bootloader with its characteristics resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootloaderLink {
    /// The connected peripheral.
    pub device: DeviceId,
    /// The matched DFU service.
    pub service: Uuid,
    /// Control point characteristic (commands out, responses in).
    pub control_point: Uuid,
    /// Packet characteristic (image bytes out).
    pub packet: Uuid,
    /// Model number characteristic, when the device exposes one. Absent on
    /// legacy bootloaders.
    pub model_number: Option<Uuid>,
}

impl BootloaderLink {
    /// True when the Device Information model number can be read to decide
    /// between the secure and legacy protocols.
    pub fn has_model_number(&self) -> bool {
        self.model_number.is_some()
    }
}

/// Application-specific recipe for rebooting a device into its bootloader.
///
/// The characteristic and command bytes come from the application firmware
/// running on the device; the bootloader itself plays no part in this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootloaderEntry {
    /// Characteristic the application listens on.
    pub characteristic: Uuid,
    /// Command payload that triggers the reboot.
    pub command: Vec<u8>,
}

impl BootloaderEntry {
    pub fn new(characteristic: Uuid, command: Vec<u8>) -> Self {
        BootloaderEntry {
            characteristic,
            command,
        }
    }
}

// ============================================================================
// Service Resolution
// ============================================================================

/// Resolve the DFU service and characteristics on a connected device.
///
/// Fails with [`DfuError::BadDevice`] when no known DFU service is present
/// and [`DfuError::ControlPointMissing`] when the service is there but its
/// control point is not.
pub async fn resolve_bootloader(
    client: &dyn GattClient,
    device: &DeviceId,
) -> DfuResult<BootloaderLink> {
    let services = client.discover_services(device).await?;

    let (service, family) = services
        .iter()
        .find_map(|s| find_dfu_family(s.uuid).map(|f| (s, f)))
        .ok_or(DfuError::BadDevice)?;

    if !service.has_characteristic(family.control_point) {
        return Err(DfuError::ControlPointMissing);
    }
    if !service.has_characteristic(family.packet) {
        return Err(DfuError::BadDevice);
    }

    let model_number = services
        .iter()
        .find(|s| s.uuid == DIS_SERVICE_UUID)
        .filter(|s| s.has_characteristic(DIS_MODEL_NUMBER_UUID))
        .map(|_| DIS_MODEL_NUMBER_UUID);

    log::debug!(
        "Resolved bootloader on {}: service {}, model number {}",
        device,
        service.uuid,
        if model_number.is_some() {
            "available"
        } else {
            "absent"
        }
    );

    Ok(BootloaderLink {
        device: device.clone(),
        service: service.uuid,
        control_point: family.control_point,
        packet: family.packet,
        model_number,
    })
}

/// Read the Device Information model number, if the link has one.
///
/// Read failures degrade to `None`; the caller then treats the bootloader
/// as legacy, which is the safe direction.
pub async fn read_model_number(client: &dyn GattClient, link: &BootloaderLink) -> Option<String> {
    let characteristic = link.model_number?;
    match client
        .read_characteristic(&link.device, characteristic)
        .await
    {
        Ok(bytes) => {
            let model = String::from_utf8_lossy(&bytes)
                .trim_end_matches('\0')
                .to_string();
            log::debug!("Model number: {:?}", model);
            Some(model)
        }
        Err(error) => {
            log::warn!("Model number read failed: {}", error);
            None
        }
    }
}

// ============================================================================
// Bootloader Entry
// ============================================================================

/// Put a device into bootloader mode and return the bootloader peripheral.
///
/// A device already advertising a DFU service is returned unchanged. For
/// anything else the entry command is written, the device reboots, and the
/// bootloader is picked up by a bounded scan and connected.
///
/// `events` is watched while the entry command is in flight: the device
/// dropping the link before the write completes fails the handover with
/// [`DfuError::ConnectionFailed`]. A disconnect after the write is the
/// expected reboot and stays in the channel for the session driver.
pub async fn enter_bootloader(
    client: &dyn GattClient,
    device: &DeviceId,
    entry: &BootloaderEntry,
    events: &mut mpsc::UnboundedReceiver<GattEvent>,
    scan_timeout: Duration,
    connect_timeout: Duration,
) -> DfuResult<DeviceId> {
    let services = client.discover_services(device).await?;
    if services.iter().any(|s| find_dfu_family(s.uuid).is_some()) {
        log::debug!("{} is already in bootloader mode", device);
        return Ok(device.clone());
    }

    log::info!("Rebooting {} into its bootloader", device);
    write_entry_command(client, device, entry, events).await?;
    if let Err(error) = client.disconnect(device).await {
        // The reboot usually tears the link down before we can
        log::debug!("Disconnect after entry command failed: {}", error);
    }

    let bootloader = client
        .scan_for_service(dfu_service_uuids().to_vec(), scan_timeout)
        .await?;
    log::info!("Bootloader advertising as {}", bootloader);

    match tokio::time::timeout(connect_timeout, client.connect(&bootloader)).await {
        Ok(Ok(())) => Ok(bootloader),
        Ok(Err(error)) => {
            log::error!("Bootloader connect failed: {}", error);
            Err(DfuError::CouldNotConnect)
        }
        Err(_) => Err(DfuError::ConnectionTimeout),
    }
}

/// Write the bootloader entry command, racing it against the link.
///
/// The write completing wins over any queued event. A disconnect of the
/// target that lands first means the entry command never made it out.
async fn write_entry_command(
    client: &dyn GattClient,
    device: &DeviceId,
    entry: &BootloaderEntry,
    events: &mut mpsc::UnboundedReceiver<GattEvent>,
) -> DfuResult<()> {
    let mut write =
        client.write_characteristic(device, entry.characteristic, entry.command.clone());
    loop {
        tokio::select! {
            biased;
            result = &mut write => return result,
            event = events.recv() => match event {
                Some(GattEvent::Disconnected { device: dropped }) if dropped == *device => {
                    log::error!("{} dropped before the entry command was delivered", device);
                    return Err(DfuError::ConnectionFailed {
                        reason: format!(
                            "{device} disconnected before the entry command was delivered"
                        ),
                    });
                }
                // Leftover traffic from the application firmware
                Some(_) => {}
                None => return Err(DfuError::transport("transport event channel closed")),
            },
        }
    }
}

// ============================================================================
// Observer Lease
// ============================================================================

/// Custody of the embedder's connection observer for the span of an update.
///
/// The updater owns all connection events while an update is in flight.
/// Releasing the lease runs the restore hook exactly once, handing event
/// handling back to whatever owned it before; an unreleased lease restores
/// on drop so no failure path can leak custody.
pub struct ObserverLease {
    restore: Option<Box<dyn FnOnce() + Send>>,
}

impl ObserverLease {
    /// Take custody, with `restore` to run on release.
    pub fn new(restore: impl FnOnce() + Send + 'static) -> Self {
        ObserverLease {
            restore: Some(Box::new(restore)),
        }
    }

    /// A lease over nothing, for embedders with no observer to park.
    pub fn detached() -> Self {
        ObserverLease { restore: None }
    }

    /// Hand the observer back. Further calls do nothing.
    pub fn release(&mut self) {
        if let Some(restore) = self.restore.take() {
            log::debug!("Restoring connection observer");
            restore();
        }
    }
}

impl Drop for ObserverLease {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DFU_FAMILY_153X, DFU_FAMILY_41C8};
    use crate::transport::{MockGattClient, ServiceInfo};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn dfu_service_info() -> ServiceInfo {
        ServiceInfo {
            uuid: DFU_FAMILY_153X.service,
            characteristics: vec![DFU_FAMILY_153X.control_point, DFU_FAMILY_153X.packet],
        }
    }

    fn dis_service_info() -> ServiceInfo {
        ServiceInfo {
            uuid: DIS_SERVICE_UUID,
            characteristics: vec![DIS_MODEL_NUMBER_UUID],
        }
    }

    // ------------------------------------------------------------------
    // resolve_bootloader
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_resolve_bootloader_first_family() {
        let mut client = MockGattClient::new();
        client
            .expect_discover_services()
            .returning(|_| Ok(vec![dfu_service_info()]));

        let link = resolve_bootloader(&client, &DeviceId::new("AA:BB"))
            .await
            .unwrap();
        assert_eq!(link.service, DFU_FAMILY_153X.service);
        assert_eq!(link.control_point, DFU_FAMILY_153X.control_point);
        assert_eq!(link.packet, DFU_FAMILY_153X.packet);
        assert!(!link.has_model_number());
    }

    #[tokio::test]
    async fn test_resolve_bootloader_second_family() {
        let mut client = MockGattClient::new();
        client.expect_discover_services().returning(|_| {
            Ok(vec![ServiceInfo {
                uuid: DFU_FAMILY_41C8.service,
                characteristics: vec![DFU_FAMILY_41C8.control_point, DFU_FAMILY_41C8.packet],
            }])
        });

        let link = resolve_bootloader(&client, &DeviceId::new("AA:BB"))
            .await
            .unwrap();
        assert_eq!(link.control_point, DFU_FAMILY_41C8.control_point);
    }

    #[tokio::test]
    async fn test_resolve_bootloader_detects_model_number() {
        let mut client = MockGattClient::new();
        client
            .expect_discover_services()
            .returning(|_| Ok(vec![dfu_service_info(), dis_service_info()]));

        let link = resolve_bootloader(&client, &DeviceId::new("AA:BB"))
            .await
            .unwrap();
        assert_eq!(link.model_number, Some(DIS_MODEL_NUMBER_UUID));
    }

    #[tokio::test]
    async fn test_resolve_bootloader_without_dfu_service() {
        let mut client = MockGattClient::new();
        client.expect_discover_services().returning(|_| {
            Ok(vec![ServiceInfo {
                uuid: DIS_SERVICE_UUID,
                characteristics: vec![],
            }])
        });

        let result = resolve_bootloader(&client, &DeviceId::new("AA:BB")).await;
        assert!(matches!(result, Err(DfuError::BadDevice)));
    }

    #[tokio::test]
    async fn test_resolve_bootloader_missing_control_point() {
        let mut client = MockGattClient::new();
        client.expect_discover_services().returning(|_| {
            Ok(vec![ServiceInfo {
                uuid: DFU_FAMILY_153X.service,
                characteristics: vec![DFU_FAMILY_153X.packet],
            }])
        });

        let result = resolve_bootloader(&client, &DeviceId::new("AA:BB")).await;
        assert!(matches!(result, Err(DfuError::ControlPointMissing)));
    }

    // ------------------------------------------------------------------
    // read_model_number
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_read_model_number_trims_nul_padding() {
        let mut client = MockGattClient::new();
        client
            .expect_read_characteristic()
            .returning(|_, _| Ok(b"Rigado Secure DFU\0\0\0".to_vec()));

        let link = BootloaderLink {
            device: DeviceId::new("AA:BB"),
            service: DFU_FAMILY_153X.service,
            control_point: DFU_FAMILY_153X.control_point,
            packet: DFU_FAMILY_153X.packet,
            model_number: Some(DIS_MODEL_NUMBER_UUID),
        };
        let model = read_model_number(&client, &link).await;
        assert_eq!(model.as_deref(), Some("Rigado Secure DFU"));
    }

    #[tokio::test]
    async fn test_read_model_number_failure_degrades_to_none() {
        let mut client = MockGattClient::new();
        client
            .expect_read_characteristic()
            .returning(|_, _| Err(DfuError::transport("read rejected")));

        let link = BootloaderLink {
            device: DeviceId::new("AA:BB"),
            service: DFU_FAMILY_153X.service,
            control_point: DFU_FAMILY_153X.control_point,
            packet: DFU_FAMILY_153X.packet,
            model_number: Some(DIS_MODEL_NUMBER_UUID),
        };
        assert_eq!(read_model_number(&client, &link).await, None);
    }

    // ------------------------------------------------------------------
    // enter_bootloader
    // ------------------------------------------------------------------

    fn entry() -> BootloaderEntry {
        BootloaderEntry::new(Uuid::from_u128(0xaaaa), vec![0xA5])
    }

    #[tokio::test]
    async fn test_enter_bootloader_skips_devices_already_in_dfu_mode() {
        let mut client = MockGattClient::new();
        client
            .expect_discover_services()
            .returning(|_| Ok(vec![dfu_service_info()]));

        let (_events_tx, mut events) = mpsc::unbounded_channel();
        let device = DeviceId::new("AA:BB");
        let result = enter_bootloader(
            &client,
            &device,
            &entry(),
            &mut events,
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(result, device);
    }

    #[tokio::test]
    async fn test_enter_bootloader_writes_command_and_reconnects() {
        let mut client = MockGattClient::new();
        client
            .expect_discover_services()
            .returning(|_| Ok(vec![dis_service_info()]));
        client
            .expect_write_characteristic()
            .withf(|_, characteristic, value| {
                *characteristic == Uuid::from_u128(0xaaaa) && value == &[0xA5]
            })
            .returning(|_, _, _| Ok(()));
        client.expect_disconnect().returning(|_| Ok(()));
        client
            .expect_scan_for_service()
            .withf(|services, _| services.contains(&DFU_FAMILY_153X.service))
            .returning(|_, _| Ok(DeviceId::new("CC:DD")));
        client
            .expect_connect()
            .withf(|device| device.as_str() == "CC:DD")
            .returning(|_| Ok(()));

        let (_events_tx, mut events) = mpsc::unbounded_channel();
        let result = enter_bootloader(
            &client,
            &DeviceId::new("AA:BB"),
            &entry(),
            &mut events,
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(result.as_str(), "CC:DD");
    }

    #[tokio::test]
    async fn test_enter_bootloader_keeps_reboot_disconnect_for_the_session() {
        let mut client = MockGattClient::new();
        client
            .expect_discover_services()
            .returning(|_| Ok(vec![dis_service_info()]));
        client
            .expect_write_characteristic()
            .returning(|_, _, _| Ok(()));
        client.expect_disconnect().returning(|_| Ok(()));
        client
            .expect_scan_for_service()
            .returning(|_, _| Ok(DeviceId::new("CC:DD")));
        client.expect_connect().returning(|_| Ok(()));

        // A disconnect racing a write that does complete counts as the
        // reboot, not a failure, and is left for the session driver
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let device = DeviceId::new("AA:BB");
        let _ = events_tx.send(GattEvent::Disconnected {
            device: device.clone(),
        });

        let result = enter_bootloader(
            &client,
            &device,
            &entry(),
            &mut events,
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(result.as_str(), "CC:DD");
        assert!(matches!(
            events.try_recv(),
            Ok(GattEvent::Disconnected { device: dropped }) if dropped == device
        ));
    }

    #[tokio::test]
    async fn test_enter_bootloader_connect_failure() {
        let mut client = MockGattClient::new();
        client
            .expect_discover_services()
            .returning(|_| Ok(vec![dis_service_info()]));
        client
            .expect_write_characteristic()
            .returning(|_, _, _| Ok(()));
        client.expect_disconnect().returning(|_| Ok(()));
        client
            .expect_scan_for_service()
            .returning(|_, _| Ok(DeviceId::new("CC:DD")));
        client
            .expect_connect()
            .returning(|_| Err(DfuError::transport("peer unreachable")));

        let (_events_tx, mut events) = mpsc::unbounded_channel();
        let result = enter_bootloader(
            &client,
            &DeviceId::new("AA:BB"),
            &entry(),
            &mut events,
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(DfuError::CouldNotConnect)));
    }

    #[tokio::test]
    async fn test_enter_bootloader_scan_timeout_propagates() {
        let mut client = MockGattClient::new();
        client
            .expect_discover_services()
            .returning(|_| Ok(vec![dis_service_info()]));
        client
            .expect_write_characteristic()
            .returning(|_, _, _| Ok(()));
        client.expect_disconnect().returning(|_| Ok(()));
        client
            .expect_scan_for_service()
            .returning(|_, _| Err(DfuError::DiscoveryTimeout { timeout_ms: 1000 }));

        let (_events_tx, mut events) = mpsc::unbounded_channel();
        let result = enter_bootloader(
            &client,
            &DeviceId::new("AA:BB"),
            &entry(),
            &mut events,
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(DfuError::DiscoveryTimeout { .. })));
    }

    // ------------------------------------------------------------------
    // ObserverLease
    // ------------------------------------------------------------------

    #[test]
    fn test_observer_lease_release_runs_restore_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let hook = Arc::clone(&count);
        let mut lease = ObserverLease::new(move || {
            hook.fetch_add(1, Ordering::SeqCst);
        });

        lease.release();
        lease.release();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        drop(lease);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_observer_lease_restores_on_drop() {
        let count = Arc::new(AtomicUsize::new(0));
        let hook = Arc::clone(&count);
        {
            let _lease = ObserverLease::new(move || {
                hook.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_detached_lease_is_inert() {
        let mut lease = ObserverLease::detached();
        lease.release();
    }
}
