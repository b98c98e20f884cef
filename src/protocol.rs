//! RigDfu update protocol engine.
//!
//! Drives a complete firmware update as a deterministic state machine:
//! 1. Discovery - resolve the bootloader service and its type
//! 2. Start - announce the transfer, write size information
//! 3. Init - signed init packet, sent in two halves (secure bootloaders)
//! 4. Patch init - patch header (patch images)
//! 5. Transfer - stream 20-byte packets, paced by receipt notifications
//!    (full images) or by need-more-data responses (patches)
//! 6. Validate - bootloader checks the received image
//! 7. Activate - swap in the new image and reboot
//!
//! The engine performs no I/O. Callers feed it [`ProtocolEvent`]s and
//! execute the [`Action`]s it returns; every transition is synchronous and
//! unit-testable without a radio. Control point write completions drive the
//! command chain; packet characteristic completions never do.

use serde::{Deserialize, Serialize};

use crate::config::{
    DfuOpcode, DfuResponseStatus, PACKET_SIZE, RECEIPT_INTERVAL, SECURE_DFU_MODEL_NUMBER,
};
use crate::error::DfuError;
use crate::image::{FirmwareImage, ImageTransfer, ImageVariant};
use crate::packet::{
    build_opcode_frame, build_receipt_interval_frame, chunk_at, chunk_count, ControlNotification,
};
use crate::transport::DeviceId;

// ============================================================================
// Events, Actions, Reports
// ============================================================================

/// Inputs to the engine, fed by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// The bootloader link is connected and ready for service discovery.
    LinkReady,
    /// Service discovery finished. `has_model_number` is true when the
    /// device exposes a Device Information model number characteristic.
    ServicesResolved { has_model_number: bool },
    /// Model number string read from the Device Information Service.
    ModelNumberRead { model: Option<String> },
    /// Control point notifications are active.
    NotificationsEnabled,
    /// An acknowledged control point write completed.
    ControlWriteCompleted,
    /// A packet characteristic write was accepted by the host stack.
    PacketWriteCompleted,
    /// A parsed control point notification arrived.
    Notification(ControlNotification),
    /// A previously requested delay elapsed.
    DelayElapsed(DelayKind),
    /// The bootloader link dropped.
    Disconnected,
    /// The embedder asked to cancel the update.
    CancelRequested,
    /// A collaborator failed outside the engine's control.
    Fault(DfuError),
}

/// Delays the engine asks the driver to schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayKind {
    /// Settle time between the two init packet halves.
    InitHalfSettle,
    /// Settle time after the activation write, covering the swap.
    ActivationSettle,
}

/// Outputs of the engine, executed by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Discover services and characteristics on the bootloader link.
    ResolveServices,
    /// Read the Device Information model number string.
    ReadModelNumber,
    /// Subscribe to control point notifications.
    EnableControlPointNotifications,
    /// Acknowledged write to the control point characteristic.
    WriteControl(Vec<u8>),
    /// Write to the packet characteristic.
    WritePacket(Vec<u8>),
    /// Schedule a [`ProtocolEvent::DelayElapsed`] for the given kind.
    StartDelay(DelayKind),
    /// Hand the connection observer back to the embedder.
    ReleaseObserver,
    /// Deliver a report to the embedder.
    Report(UpdateEvent),
}

/// Reports delivered to the embedder over the course of an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum UpdateEvent {
    /// Free-form description of the current stage.
    Status { message: String },
    /// Transfer progress.
    Progress {
        percent: u8,
        bytes_sent: usize,
        total_bytes: usize,
    },
    /// The original connection went away because the device rebooted into
    /// its bootloader. Only seen when the session entered the bootloader
    /// itself.
    DeviceRebooted { device: DeviceId },
    /// The update finished and the new image is active.
    Completed,
    /// The update stopped on request; the device was reset without
    /// activating anything.
    Cancelled,
    /// The update failed.
    Failed { code: i32, message: String },
}

impl UpdateEvent {
    fn status(message: impl Into<String>) -> Self {
        UpdateEvent::Status {
            message: message.into(),
        }
    }
}

// ============================================================================
// States
// ============================================================================

/// Update session states.
///
/// Booleans inside variants replace what the original flag-driven flow
/// tracked implicitly; every completion that can arrive in either order is
/// recorded explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    DiscoveringBootloaderService,
    NotificationsEnabling,
    SendingStart,
    SendingInit,
    SendingPatchInit,
    EnablingPacketReceipts { receipts_configured: bool },
    TransferringImage,
    AwaitingValidationResult { write_complete: bool, validated: bool },
    Activating { write_complete: bool },
    Completed,
    Cancelled,
    Failed,
}

impl UpdateState {
    /// True once the session has reached an end state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UpdateState::Completed | UpdateState::Cancelled | UpdateState::Failed
        )
    }
}

// ============================================================================
// Engine
// ============================================================================

/// The update state machine.
///
/// Owns the firmware image and all transfer bookkeeping; the driver owns
/// the radio. Feed events with [`Engine::handle`] and execute the returned
/// actions in order.
pub struct Engine {
    state: UpdateState,
    image: Option<FirmwareImage>,
    transfer: Option<ImageTransfer>,
    packets_sent: usize,
    bytes_sent: usize,
    observer_released: bool,
    finished: bool,
    failure: Option<DfuError>,
}

impl Engine {
    pub fn new(image: FirmwareImage) -> Self {
        Engine {
            state: UpdateState::Idle,
            image: Some(image),
            transfer: None,
            packets_sent: 0,
            bytes_sent: 0,
            observer_released: false,
            finished: false,
            failure: None,
        }
    }

    /// Current session state.
    pub fn state(&self) -> &UpdateState {
        &self.state
    }

    /// True once the final report (completed, cancelled or failed) has
    /// been emitted. No further actions follow.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// The error behind a [`UpdateState::Failed`] session, if any.
    pub fn failure(&self) -> Option<&DfuError> {
        self.failure.as_ref()
    }

    /// Rewind for a fresh protocol run over a re-established link.
    ///
    /// The resolved image layout is kept; re-discovery verifies the
    /// bootloader type still matches.
    pub fn reset_for_retry(&mut self) {
        if self.finished {
            return;
        }
        self.state = UpdateState::Idle;
        self.packets_sent = 0;
        self.bytes_sent = 0;
    }

    /// Feed one event and collect the actions it produces.
    pub fn handle(&mut self, event: ProtocolEvent) -> Vec<Action> {
        if self.finished {
            log::debug!("Event after session end ignored: {:?}", event);
            return Vec::new();
        }

        match event {
            ProtocolEvent::CancelRequested => self.on_cancel(),
            ProtocolEvent::Disconnected => self.on_disconnect(),
            ProtocolEvent::Fault(error) => {
                let mapped = self.map_fault(error);
                self.fail(mapped)
            }
            ProtocolEvent::LinkReady => self.on_link_ready(),
            ProtocolEvent::ServicesResolved { has_model_number } => {
                self.on_services_resolved(has_model_number)
            }
            ProtocolEvent::ModelNumberRead { model } => self.on_model_number(model),
            ProtocolEvent::NotificationsEnabled => self.on_notifications_enabled(),
            ProtocolEvent::ControlWriteCompleted => self.on_control_write_completed(),
            ProtocolEvent::PacketWriteCompleted => {
                // Packet writes never gate the command chain
                Vec::new()
            }
            ProtocolEvent::DelayElapsed(kind) => self.on_delay_elapsed(kind),
            ProtocolEvent::Notification(notification) => self.on_notification(notification),
        }
    }

    // ------------------------------------------------------------------
    // Discovery and setup
    // ------------------------------------------------------------------

    fn on_link_ready(&mut self) -> Vec<Action> {
        match self.state {
            UpdateState::Idle => {
                self.state = UpdateState::DiscoveringBootloaderService;
                vec![
                    Action::Report(UpdateEvent::status("Discovering bootloader service")),
                    Action::ResolveServices,
                ]
            }
            _ => self.ignore("link ready"),
        }
    }

    fn on_services_resolved(&mut self, has_model_number: bool) -> Vec<Action> {
        match self.state {
            UpdateState::DiscoveringBootloaderService => {
                if has_model_number {
                    vec![Action::ReadModelNumber]
                } else {
                    // No Device Information Service: legacy bootloader
                    self.resolve_bootloader_type(false)
                }
            }
            _ => self.ignore("service discovery result"),
        }
    }

    fn on_model_number(&mut self, model: Option<String>) -> Vec<Action> {
        match self.state {
            UpdateState::DiscoveringBootloaderService => {
                let secure = model.as_deref() == Some(SECURE_DFU_MODEL_NUMBER);
                log::info!(
                    "Bootloader model {:?} -> {} protocol",
                    model,
                    if secure { "secure" } else { "legacy" }
                );
                self.resolve_bootloader_type(secure)
            }
            _ => self.ignore("model number read"),
        }
    }

    fn resolve_bootloader_type(&mut self, secure: bool) -> Vec<Action> {
        if let Some(existing) = self.transfer.as_ref() {
            // Already resolved on a previous attempt over this session;
            // the same device must not change type between connections.
            let was_secure = existing.variant() != ImageVariant::Legacy;
            if was_secure != secure {
                return self.fail(DfuError::BadDevice);
            }
        } else {
            let image = match self.image.take() {
                Some(image) => image,
                None => return self.fail(DfuError::Unknown),
            };
            match ImageTransfer::new(image, secure) {
                Ok(transfer) => {
                    log::info!(
                        "Update image: {} ({} payload bytes, {} packets)",
                        transfer.variant().description(),
                        transfer.payload_size(),
                        chunk_count(transfer.payload_size())
                    );
                    self.transfer = Some(transfer);
                }
                Err(error) => return self.fail(error),
            }
        }

        self.state = UpdateState::NotificationsEnabling;
        vec![Action::EnableControlPointNotifications]
    }

    fn on_notifications_enabled(&mut self) -> Vec<Action> {
        match self.state {
            UpdateState::NotificationsEnabling => {
                self.state = UpdateState::SendingStart;
                vec![
                    Action::Report(UpdateEvent::status("Initializing firmware update")),
                    Action::WriteControl(build_opcode_frame(DfuOpcode::Start)),
                ]
            }
            _ => self.ignore("notification setup completion"),
        }
    }

    // ------------------------------------------------------------------
    // Control point write completions
    // ------------------------------------------------------------------

    fn on_control_write_completed(&mut self) -> Vec<Action> {
        match self.state {
            // Start opcode is on the wire; follow with the size frame on
            // the packet characteristic
            UpdateState::SendingStart => {
                let frame = self.transfer.as_ref().map(ImageTransfer::start_frame);
                match frame {
                    Some(frame) => vec![
                        Action::Report(UpdateEvent::status("Writing firmware image size")),
                        Action::WritePacket(frame),
                    ],
                    None => self.fail(DfuError::Unknown),
                }
            }

            // Init opcode acknowledged; stream the first init half, then
            // let the settle delay trigger the second
            UpdateState::SendingInit => match self.init_half(0) {
                Some(half) => vec![
                    Action::WritePacket(half),
                    Action::StartDelay(DelayKind::InitHalfSettle),
                ],
                None => self.fail(DfuError::Unknown),
            },

            // Patch init opcode acknowledged; send the patch header
            UpdateState::SendingPatchInit => {
                let block = self
                    .transfer
                    .as_ref()
                    .and_then(|t| t.patch_init_block().map(<[u8]>::to_vec));
                match block {
                    Some(block) => vec![Action::WritePacket(block)],
                    None => self.fail(DfuError::Unknown),
                }
            }

            UpdateState::EnablingPacketReceipts {
                receipts_configured: false,
            } => {
                self.state = UpdateState::EnablingPacketReceipts {
                    receipts_configured: true,
                };
                vec![Action::WriteControl(build_opcode_frame(
                    DfuOpcode::ReceiveFirmwareImage,
                ))]
            }
            UpdateState::EnablingPacketReceipts {
                receipts_configured: true,
            } => self.begin_transfer(),

            // For patches this is the receive-patch opcode completing;
            // the first chunk goes out now (no receipts in patch mode)
            UpdateState::TransferringImage => {
                if self.is_patch() && self.packets_sent == 0 {
                    self.send_next_chunk(true)
                } else {
                    Vec::new()
                }
            }

            UpdateState::AwaitingValidationResult {
                write_complete: false,
                validated,
            } => {
                self.state = UpdateState::AwaitingValidationResult {
                    write_complete: true,
                    validated,
                };
                if validated {
                    self.begin_activation()
                } else {
                    Vec::new()
                }
            }

            UpdateState::Activating {
                write_complete: false,
            } => {
                // The bootloader now owns the swap; give it time to
                // reboot before declaring success
                self.state = UpdateState::Activating {
                    write_complete: true,
                };
                vec![Action::StartDelay(DelayKind::ActivationSettle)]
            }

            UpdateState::Cancelled => self.finish_cancel(),

            _ => {
                log::debug!(
                    "Control write completion in {:?} has no follow-up",
                    self.state
                );
                Vec::new()
            }
        }
    }

    fn on_delay_elapsed(&mut self, kind: DelayKind) -> Vec<Action> {
        match (kind, self.state.clone()) {
            (DelayKind::InitHalfSettle, UpdateState::SendingInit) => match self.init_half(1) {
                Some(half) => vec![Action::WritePacket(half)],
                None => self.fail(DfuError::Unknown),
            },
            (
                DelayKind::ActivationSettle,
                UpdateState::Activating {
                    write_complete: true,
                },
            ) => self.complete(),
            _ => self.ignore("delay expiry"),
        }
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    fn on_notification(&mut self, notification: ControlNotification) -> Vec<Action> {
        match notification {
            ControlNotification::PacketReceipt { bytes_received } => {
                self.on_packet_receipt(bytes_received)
            }
            ControlNotification::Response { request, status } => {
                self.on_response(request, status)
            }
        }
    }

    fn on_packet_receipt(&mut self, bytes_received: u32) -> Vec<Action> {
        if self.state != UpdateState::TransferringImage || self.is_patch() {
            return self.ignore("packet receipt");
        }
        let total = match self.transfer.as_ref() {
            Some(transfer) => transfer.payload_size(),
            None => return self.fail(DfuError::Unknown),
        };

        // The count the bootloader reports should match what we have put
        // on the wire; a mismatch means dropped packets but the receipt
        // pacing keeps the stream usable, so carry on
        let expected = (self.packets_sent * PACKET_SIZE).min(total);
        if bytes_received as usize != expected {
            log::error!(
                "Receipt count mismatch: device has {} bytes, expected {}",
                bytes_received,
                expected
            );
        }

        let mut actions = vec![Action::Report(UpdateEvent::Progress {
            percent: percent(bytes_received as usize, total),
            bytes_sent: bytes_received as usize,
            total_bytes: total,
        })];

        if self.packets_sent < chunk_count(total) {
            actions.extend(self.send_next_chunk(false));
        }
        actions
    }

    fn on_response(&mut self, request: DfuOpcode, status: DfuResponseStatus) -> Vec<Action> {
        match (self.state.clone(), request) {
            (UpdateState::SendingStart, DfuOpcode::Start) => {
                if status != DfuResponseStatus::Success {
                    return self.fail_on_status(request, status);
                }
                if self.is_secure() {
                    self.state = UpdateState::SendingInit;
                    vec![Action::WriteControl(build_opcode_frame(DfuOpcode::Init))]
                } else {
                    self.begin_receipt_setup()
                }
            }

            (UpdateState::SendingInit, DfuOpcode::Init) => {
                if status != DfuResponseStatus::Success {
                    return self.fail_on_status(request, status);
                }
                if self.is_patch() {
                    self.state = UpdateState::SendingPatchInit;
                    vec![Action::WriteControl(build_opcode_frame(
                        DfuOpcode::InitializePatch,
                    ))]
                } else {
                    self.begin_receipt_setup()
                }
            }

            (UpdateState::SendingPatchInit, DfuOpcode::InitializePatch) => {
                if status != DfuResponseStatus::Success {
                    return self.fail_on_status(request, status);
                }
                // Patch transfers skip receipt setup; pacing comes from
                // need-more-data responses instead
                self.state = UpdateState::TransferringImage;
                vec![
                    Action::Report(UpdateEvent::status("Transferring firmware patch")),
                    Action::WriteControl(build_opcode_frame(DfuOpcode::ReceivePatchImage)),
                ]
            }

            (UpdateState::TransferringImage, DfuOpcode::ReceiveFirmwareImage) => {
                if status != DfuResponseStatus::Success {
                    return self.fail_on_status(request, status);
                }
                self.begin_validation()
            }

            (UpdateState::TransferringImage, DfuOpcode::ReceivePatchImage) => match status {
                DfuResponseStatus::PatchNeedMoreData => {
                    if self.packets_sent < self.patch_chunk_count() {
                        self.send_next_chunk(true)
                    } else {
                        log::error!("Bootloader wants more patch data but none remains");
                        self.fail(DfuError::Unknown)
                    }
                }
                DfuResponseStatus::Success => self.begin_validation(),
                _ => self.fail_on_status(request, status),
            },

            (
                UpdateState::AwaitingValidationResult {
                    write_complete,
                    validated: false,
                },
                DfuOpcode::ValidateFirmwareImage,
            ) => {
                if status != DfuResponseStatus::Success {
                    return self.fail_on_status(request, status);
                }
                self.state = UpdateState::AwaitingValidationResult {
                    write_complete,
                    validated: true,
                };
                if write_complete {
                    self.begin_activation()
                } else {
                    Vec::new()
                }
            }

            _ => {
                log::warn!(
                    "Unexpected response {:?}/{:?} in {:?}",
                    request,
                    status,
                    self.state
                );
                Vec::new()
            }
        }
    }

    // ------------------------------------------------------------------
    // Stage transitions
    // ------------------------------------------------------------------

    fn begin_receipt_setup(&mut self) -> Vec<Action> {
        self.state = UpdateState::EnablingPacketReceipts {
            receipts_configured: false,
        };
        vec![
            Action::Report(UpdateEvent::status("Enabling packet receipt notifications")),
            Action::WriteControl(build_receipt_interval_frame(RECEIPT_INTERVAL)),
        ]
    }

    fn begin_transfer(&mut self) -> Vec<Action> {
        self.state = UpdateState::TransferringImage;
        let mut actions = vec![Action::Report(UpdateEvent::status(
            "Transferring firmware image",
        ))];
        actions.extend(self.send_next_chunk(false));
        actions
    }

    fn begin_validation(&mut self) -> Vec<Action> {
        self.state = UpdateState::AwaitingValidationResult {
            write_complete: false,
            validated: false,
        };
        vec![
            Action::Report(UpdateEvent::status("Validating firmware image")),
            Action::WriteControl(build_opcode_frame(DfuOpcode::ValidateFirmwareImage)),
        ]
    }

    fn begin_activation(&mut self) -> Vec<Action> {
        self.state = UpdateState::Activating {
            write_complete: false,
        };
        let mut actions = vec![Action::Report(UpdateEvent::status(
            "Activating firmware image",
        ))];
        // Give the connection back before the device reboots out from
        // under us; the activation disconnect belongs to the embedder
        actions.extend(self.release_observer());
        actions.push(Action::WriteControl(build_opcode_frame(
            DfuOpcode::ActivateFirmwareImage,
        )));
        actions
    }

    // ------------------------------------------------------------------
    // Cancellation, disconnects, failure
    // ------------------------------------------------------------------

    fn on_cancel(&mut self) -> Vec<Action> {
        match self.state {
            UpdateState::Cancelled => Vec::new(),
            // No control point yet: nothing to reset, stop right away
            UpdateState::Idle | UpdateState::DiscoveringBootloaderService => {
                self.state = UpdateState::Cancelled;
                self.finish_cancel()
            }
            UpdateState::Completed | UpdateState::Failed => Vec::new(),
            // Reset the bootloader exactly once; cleanup happens when the
            // write completes (or the link drops first)
            _ => {
                log::info!("Cancelling update; resetting bootloader");
                self.state = UpdateState::Cancelled;
                vec![Action::WriteControl(build_opcode_frame(
                    DfuOpcode::SystemReset,
                ))]
            }
        }
    }

    fn finish_cancel(&mut self) -> Vec<Action> {
        self.finished = true;
        let mut actions = self.release_observer();
        actions.push(Action::Report(UpdateEvent::Cancelled));
        actions
    }

    fn on_disconnect(&mut self) -> Vec<Action> {
        match self.state {
            UpdateState::Idle => Vec::new(),
            // A cancel reset drops the link; still a cancel, not a failure
            UpdateState::Cancelled => self.finish_cancel(),
            // After the activation write the reboot disconnect is expected
            UpdateState::Activating {
                write_complete: true,
            } => {
                log::debug!("Bootloader rebooted into the new image");
                Vec::new()
            }
            _ => self.fail(DfuError::BootloaderDisconnect),
        }
    }

    fn fail(&mut self, error: DfuError) -> Vec<Action> {
        // A cancelled session stays cancelled no matter what the teardown
        // drags in behind it
        if self.state == UpdateState::Cancelled {
            log::debug!("Suppressing error during cancellation: {}", error);
            return self.finish_cancel();
        }
        log::error!("Update failed in {:?}: {}", self.state, error);
        self.state = UpdateState::Failed;
        self.finished = true;
        let mut actions = self.release_observer();
        actions.push(Action::Report(UpdateEvent::Failed {
            code: error.error_code(),
            message: error.to_string(),
        }));
        self.failure = Some(error);
        actions
    }

    fn fail_on_status(&mut self, request: DfuOpcode, status: DfuResponseStatus) -> Vec<Action> {
        log::error!(
            "Bootloader rejected {:?}: {}",
            request,
            status.description()
        );
        let crc = status == DfuResponseStatus::CrcError;
        let error = match request {
            // A patch's signed init packet carries the CRC of the firmware
            // it patches; a CRC rejection here means wrong base image
            DfuOpcode::Init => {
                if crc && self.is_patch() {
                    DfuError::PatchCrcMismatch
                } else {
                    DfuError::Unknown
                }
            }
            DfuOpcode::InitializePatch => {
                if crc {
                    DfuError::PatchCrcMismatch
                } else {
                    DfuError::PatchInitWriteFailure
                }
            }
            DfuOpcode::ReceivePatchImage => {
                if crc {
                    DfuError::PostPatchCrcMismatch
                } else {
                    DfuError::Unknown
                }
            }
            DfuOpcode::ValidateFirmwareImage => {
                if crc && self.is_patch() {
                    DfuError::PostPatchCrcMismatch
                } else {
                    DfuError::ImageValidationFailure
                }
            }
            DfuOpcode::ActivateFirmwareImage => DfuError::ImageActivationFailure,
            _ => DfuError::Unknown,
        };
        self.fail(error)
    }

    /// Pin transport faults to the stage-specific error where one exists.
    fn map_fault(&self, error: DfuError) -> DfuError {
        if !matches!(error, DfuError::Transport { .. }) {
            return error;
        }
        match self.state {
            UpdateState::SendingPatchInit => DfuError::PatchInitWriteFailure,
            UpdateState::AwaitingValidationResult {
                write_complete: false,
                ..
            } => DfuError::ValidationWriteFailure,
            _ => error,
        }
    }

    fn complete(&mut self) -> Vec<Action> {
        log::info!("Firmware update complete");
        self.state = UpdateState::Completed;
        self.finished = true;
        vec![Action::Report(UpdateEvent::Completed)]
    }

    fn release_observer(&mut self) -> Vec<Action> {
        if self.observer_released {
            Vec::new()
        } else {
            self.observer_released = true;
            vec![Action::ReleaseObserver]
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn is_secure(&self) -> bool {
        matches!(
            self.transfer.as_ref().map(ImageTransfer::variant),
            Some(ImageVariant::Secure) | Some(ImageVariant::SecurePatch)
        )
    }

    fn is_patch(&self) -> bool {
        matches!(
            self.transfer.as_ref().map(ImageTransfer::variant),
            Some(ImageVariant::SecurePatch)
        )
    }

    fn patch_chunk_count(&self) -> usize {
        self.transfer
            .as_ref()
            .map(|t| chunk_count(t.payload_size()))
            .unwrap_or(0)
    }

    fn init_half(&self, index: usize) -> Option<Vec<u8>> {
        let (first, second) = self.transfer.as_ref()?.init_halves()?;
        match index {
            0 => Some(first.to_vec()),
            1 => Some(second.to_vec()),
            _ => None,
        }
    }

    /// Send the next payload chunk, optionally reporting progress from the
    /// sender's side (patch mode has no receipts to report from).
    fn send_next_chunk(&mut self, report: bool) -> Vec<Action> {
        let (chunk, total) = match self.transfer.as_ref() {
            Some(transfer) => (
                chunk_at(transfer.payload(), self.packets_sent).map(|c| c.to_vec()),
                transfer.payload_size(),
            ),
            None => return self.fail(DfuError::Unknown),
        };
        let chunk = match chunk {
            Some(chunk) => chunk,
            None => return Vec::new(),
        };

        self.packets_sent += 1;
        self.bytes_sent += chunk.len();

        let mut actions = Vec::with_capacity(2);
        actions.push(Action::WritePacket(chunk));
        if report {
            actions.push(Action::Report(UpdateEvent::Progress {
                percent: percent(self.bytes_sent, total),
                bytes_sent: self.bytes_sent,
                total_bytes: total,
            }));
        }
        actions
    }

    fn ignore(&self, what: &str) -> Vec<Action> {
        log::warn!("Ignoring {} in {:?}", what, self.state);
        Vec::new()
    }
}

fn percent(bytes: usize, total: usize) -> u8 {
    if total == 0 {
        0
    } else {
        ((bytes * 100) / total).min(100) as u8
    }
}
