//! Asynchronous update driver.
//!
//! [`FirmwareUpdater`] owns the radio side of an update session and drives
//! the protocol engine in `protocol.rs`:
//! * serializes control point and packet writes through a [`GattQueue`]
//!   so exactly one GATT operation is in flight at a time
//! * spawns one task per operation, bounded by a write watchdog
//! * turns operation outcomes, notifications, disconnects and timer
//!   expiries into engine events
//! * applies the engine's actions back onto the link
//!
//! Reconnects restart the protocol from discovery over the same session;
//! a generation counter fences out operation outcomes and timers that
//! belong to the link that dropped. One update runs at a time per updater;
//! a second request is refused outright.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::config::{
    ACTIVATE_SETTLE_DELAY, BOOTLOADER_CONNECT_TIMEOUT, DEFAULT_OPERATION_TIMEOUT,
    DEFAULT_SCAN_TIMEOUT, INIT_HALF_SETTLE_DELAY, RECONNECT_TIMEOUT,
};
use crate::device::{
    enter_bootloader, read_model_number, resolve_bootloader, BootloaderEntry, BootloaderLink,
    ObserverLease,
};
use crate::error::{DfuError, DfuResult};
use crate::image::FirmwareImage;
use crate::packet::parse_notification;
use crate::protocol::{Action, DelayKind, Engine, ProtocolEvent, UpdateEvent, UpdateState};
use crate::transport::{DeviceId, GattClient, GattEvent, GattOp, GattOpKind, GattQueue, OpOutcome};

// ============================================================================
// Configuration
// ============================================================================

/// Tunables for an update session.
#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    /// Automatic reconnect attempts after an unexpected disconnect. Each
    /// successful reconnect restarts the protocol from discovery.
    pub reconnect_attempts: u32,
    /// How long to scan for the bootloader advertisement after the entry
    /// command reboots the device.
    pub scan_timeout: Duration,
    /// Connect deadline for the freshly discovered bootloader.
    pub connect_timeout: Duration,
    /// Connect deadline when re-establishing a dropped link.
    pub reconnect_timeout: Duration,
    /// Watchdog for each individual GATT operation. `None` disables it.
    pub write_timeout: Option<Duration>,
    /// Pause between the two init packet halves.
    pub init_half_delay: Duration,
    /// Pause after the activation write before declaring success.
    pub activate_settle_delay: Duration,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        UpdaterConfig {
            reconnect_attempts: 0,
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            connect_timeout: BOOTLOADER_CONNECT_TIMEOUT,
            reconnect_timeout: RECONNECT_TIMEOUT,
            write_timeout: Some(DEFAULT_OPERATION_TIMEOUT),
            init_half_delay: INIT_HALF_SETTLE_DELAY,
            activate_settle_delay: ACTIVATE_SETTLE_DELAY,
        }
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Cooperative cancellation handle for an update session.
///
/// Cloning is cheap; any clone can cancel. Cancelling a session sends the
/// bootloader a system reset so the device does not sit in DFU mode with a
/// half-written image.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once cancellation has been requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

// ============================================================================
// Session Request
// ============================================================================

/// Everything one update session needs.
pub struct UpdateRequest {
    /// The connected target. Either the bootloader itself or, with
    /// `bootloader_entry` set, the application firmware to reboot out of.
    pub device: DeviceId,
    /// The image to transfer.
    pub image: FirmwareImage,
    /// Recipe for rebooting the application into its bootloader. `None`
    /// when the target already runs the bootloader.
    pub bootloader_entry: Option<BootloaderEntry>,
    /// The embedder's parked connection observer.
    pub observer: ObserverLease,
}

// ============================================================================
// Updater
// ============================================================================

/// Drives firmware updates over a [`GattClient`].
pub struct FirmwareUpdater {
    client: Arc<dyn GattClient>,
    config: UpdaterConfig,
    busy: Arc<AtomicBool>,
}

/// Clears the busy flag when a session ends, on every exit path.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl FirmwareUpdater {
    pub fn new(client: Arc<dyn GattClient>, config: UpdaterConfig) -> Self {
        FirmwareUpdater {
            client,
            config,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// True while an update session is running.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Run one update session to completion.
    ///
    /// `gatt_events` carries the link's notifications and disconnects;
    /// `reports` receives progress and outcome events as they happen. The
    /// final outcome is also the return value: `Ok` on activation,
    /// [`DfuError::UpdateCancelled`] when `cancel` fired, or the error
    /// that ended the session.
    pub async fn update(
        &self,
        request: UpdateRequest,
        mut gatt_events: mpsc::UnboundedReceiver<GattEvent>,
        reports: mpsc::UnboundedSender<UpdateEvent>,
        cancel: CancelToken,
    ) -> DfuResult<()> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DfuError::UpdateInProgress);
        }
        let _busy = BusyGuard(Arc::clone(&self.busy));

        let UpdateRequest {
            device,
            image,
            bootloader_entry,
            observer,
        } = request;

        // The handover can sit in a scan or connect for tens of seconds;
        // cancellation applies there just like inside the session proper
        let (device, origin) = match bootloader_entry {
            Some(entry) => {
                let handover = enter_bootloader(
                    self.client.as_ref(),
                    &device,
                    &entry,
                    &mut gatt_events,
                    self.config.scan_timeout,
                    self.config.connect_timeout,
                );
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        log::info!("Update cancelled during bootloader handover");
                        let _ = reports.send(UpdateEvent::Cancelled);
                        return Err(DfuError::UpdateCancelled);
                    }
                    outcome = handover => outcome,
                };
                match outcome {
                    Ok(bootloader) => {
                        let origin = (bootloader != device).then_some(device);
                        (bootloader, origin)
                    }
                    Err(error) => {
                        let _ = reports.send(UpdateEvent::Failed {
                            code: error.error_code(),
                            message: error.to_string(),
                        });
                        return Err(error);
                    }
                }
            }
            None => (device, None),
        };

        log::info!("Starting firmware update session on {}", device);
        self.drive(device, origin, image, observer, gatt_events, reports, cancel)
            .await
    }

    async fn drive(
        &self,
        device: DeviceId,
        origin: Option<DeviceId>,
        image: FirmwareImage,
        observer: ObserverLease,
        mut gatt_events: mpsc::UnboundedReceiver<GattEvent>,
        reports: mpsc::UnboundedSender<UpdateEvent>,
        cancel: CancelToken,
    ) -> DfuResult<()> {
        let (internal_tx, mut internal_rx) = mpsc::unbounded_channel();
        let mut driver = Driver {
            client: Arc::clone(&self.client),
            config: self.config.clone(),
            engine: Engine::new(image),
            queue: GattQueue::new(),
            device,
            origin,
            link: None,
            lease: observer,
            reports,
            internal_tx,
            generation: 0,
            reconnects_left: self.config.reconnect_attempts,
            outcome: None,
        };
        let mut cancel_requested = false;

        driver.pump(ProtocolEvent::LinkReady).await;

        while !driver.engine.is_finished() {
            tokio::select! {
                _ = cancel.cancelled(), if !cancel_requested => {
                    cancel_requested = true;
                    // Anything still queued is pointless now; the reset
                    // should be the next write on the wire
                    driver.queue.drain();
                    driver.pump(ProtocolEvent::CancelRequested).await;
                }
                message = internal_rx.recv() => match message {
                    Some(message) if message.generation == driver.generation => {
                        match message.payload {
                            DriverPayload::Outcome(outcome) => {
                                let event = driver.on_outcome(outcome);
                                driver.pump(event).await;
                            }
                            DriverPayload::Delay(kind) => {
                                driver.pump(ProtocolEvent::DelayElapsed(kind)).await;
                            }
                        }
                    }
                    Some(message) => {
                        log::debug!(
                            "Dropping stale internal message from generation {}",
                            message.generation
                        );
                    }
                    None => break,
                },
                event = gatt_events.recv() => match event {
                    Some(event) => driver.on_gatt_event(event).await,
                    None => {
                        driver
                            .pump(ProtocolEvent::Fault(DfuError::transport(
                                "transport event channel closed",
                            )))
                            .await;
                    }
                },
            }
        }

        let outcome = driver.outcome.take().unwrap_or(Err(DfuError::Unknown));
        if outcome.is_err() {
            // Completed sessions lose the link to the activation reboot;
            // everything else still holds it
            if let Err(error) = self.client.disconnect(&driver.device).await {
                log::debug!("Post-session disconnect failed: {}", error);
            }
        }
        outcome
    }
}

// ============================================================================
// Driver Internals
// ============================================================================

struct DriverMessage {
    generation: u64,
    payload: DriverPayload,
}

enum DriverPayload {
    Outcome(OpOutcome),
    Delay(DelayKind),
}

struct Driver {
    client: Arc<dyn GattClient>,
    config: UpdaterConfig,
    engine: Engine,
    queue: GattQueue,
    device: DeviceId,
    /// The application device the session rebooted out of, until its
    /// old connection's disconnect has been reported. `None` for sessions
    /// that started on the bootloader.
    origin: Option<DeviceId>,
    link: Option<BootloaderLink>,
    lease: ObserverLease,
    reports: mpsc::UnboundedSender<UpdateEvent>,
    internal_tx: mpsc::UnboundedSender<DriverMessage>,
    generation: u64,
    reconnects_left: u32,
    outcome: Option<DfuResult<()>>,
}

impl Driver {
    /// Feed one event through the engine, executing actions as they come.
    /// Discovery actions complete inline and feed follow-up events.
    async fn pump(&mut self, first: ProtocolEvent) {
        let mut events = VecDeque::new();
        events.push_back(first);
        while let Some(event) = events.pop_front() {
            for action in self.engine.handle(event) {
                if let Some(follow_up) = self.perform(action).await {
                    events.push_back(follow_up);
                }
            }
        }
    }

    async fn perform(&mut self, action: Action) -> Option<ProtocolEvent> {
        match action {
            Action::ResolveServices => {
                match resolve_bootloader(self.client.as_ref(), &self.device).await {
                    Ok(link) => {
                        let has_model_number = link.has_model_number();
                        self.link = Some(link);
                        Some(ProtocolEvent::ServicesResolved { has_model_number })
                    }
                    Err(error) => Some(ProtocolEvent::Fault(error)),
                }
            }
            Action::ReadModelNumber => {
                let link = self.link.clone()?;
                let model = read_model_number(self.client.as_ref(), &link).await;
                Some(ProtocolEvent::ModelNumberRead { model })
            }
            Action::EnableControlPointNotifications => {
                self.submit(GattOp::EnableNotifications);
                None
            }
            Action::WriteControl(bytes) => {
                self.submit(GattOp::WriteControl(bytes));
                None
            }
            Action::WritePacket(bytes) => {
                self.submit(GattOp::WritePacket(bytes));
                None
            }
            Action::StartDelay(kind) => {
                self.start_delay(kind);
                None
            }
            Action::ReleaseObserver => {
                self.lease.release();
                None
            }
            Action::Report(event) => {
                self.deliver(event);
                None
            }
        }
    }

    fn submit(&mut self, op: GattOp) {
        if let Some(ready) = self.queue.submit(op) {
            self.dispatch(ready);
        }
    }

    /// Map a finished operation to its engine event, dispatching whatever
    /// the queue had waiting behind it.
    fn on_outcome(&mut self, outcome: OpOutcome) -> ProtocolEvent {
        if let Some(next) = self.queue.complete() {
            self.dispatch(next);
        }
        match outcome.result {
            Ok(()) => match outcome.kind {
                GattOpKind::EnableNotifications => ProtocolEvent::NotificationsEnabled,
                GattOpKind::WriteControl => ProtocolEvent::ControlWriteCompleted,
                GattOpKind::WritePacket => ProtocolEvent::PacketWriteCompleted,
            },
            Err(error) => ProtocolEvent::Fault(error),
        }
    }

    fn dispatch(&self, op: GattOp) {
        let kind = op.kind();
        let link = match self.link.clone() {
            Some(link) => link,
            None => {
                let _ = self.internal_tx.send(DriverMessage {
                    generation: self.generation,
                    payload: DriverPayload::Outcome(OpOutcome {
                        kind,
                        result: Err(DfuError::transport("no bootloader link resolved")),
                    }),
                });
                return;
            }
        };

        let client = Arc::clone(&self.client);
        let tx = self.internal_tx.clone();
        let generation = self.generation;
        let write_timeout = self.config.write_timeout;

        tokio::spawn(async move {
            let operation = async {
                match op {
                    GattOp::EnableNotifications => {
                        client
                            .set_notifications(&link.device, link.control_point, true)
                            .await
                    }
                    GattOp::WriteControl(bytes) => {
                        client
                            .write_characteristic(&link.device, link.control_point, bytes)
                            .await
                    }
                    GattOp::WritePacket(bytes) => {
                        client
                            .write_characteristic_no_response(&link.device, link.packet, bytes)
                            .await
                    }
                }
            };
            let result = match write_timeout {
                Some(limit) => match tokio::time::timeout(limit, operation).await {
                    Ok(result) => result,
                    Err(_) => Err(DfuError::OperationTimeout {
                        operation: kind.describe().to_string(),
                    }),
                },
                None => operation.await,
            };
            let _ = tx.send(DriverMessage {
                generation,
                payload: DriverPayload::Outcome(OpOutcome { kind, result }),
            });
        });
    }

    fn start_delay(&self, kind: DelayKind) {
        let duration = match kind {
            DelayKind::InitHalfSettle => self.config.init_half_delay,
            DelayKind::ActivationSettle => self.config.activate_settle_delay,
        };
        let tx = self.internal_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = tx.send(DriverMessage {
                generation,
                payload: DriverPayload::Delay(kind),
            });
        });
    }

    async fn on_gatt_event(&mut self, event: GattEvent) {
        match event {
            GattEvent::Notification {
                device,
                characteristic,
                value,
            } => {
                if !self.is_session_device(&device) || !self.is_control_point(characteristic) {
                    log::debug!("Ignoring notification from {} {}", device, characteristic);
                    return;
                }
                match parse_notification(&value) {
                    Ok(notification) => {
                        self.pump(ProtocolEvent::Notification(notification)).await;
                    }
                    Err(error) => {
                        log::warn!("Dropping malformed control point notification: {}", error);
                    }
                }
            }
            GattEvent::Disconnected { device } => {
                if self.is_session_device(&device) {
                    self.on_disconnect().await;
                } else if self.origin.as_ref() == Some(&device) {
                    // The application connection dying is the tail end of
                    // the handover; the embedder gets told, the engine
                    // does not care
                    log::debug!("{} rebooted into its bootloader", device);
                    self.origin = None;
                    self.deliver(UpdateEvent::DeviceRebooted { device });
                }
            }
        }
    }

    async fn on_disconnect(&mut self) {
        if self.engine.is_finished() {
            return;
        }
        // The reconnect window closes once activation starts: from there
        // the engine owns the disconnect, either as the expected reboot or
        // as its own failure. Cancel resets drop the link on purpose.
        let reconnectable = !matches!(
            self.engine.state(),
            UpdateState::Activating { .. } | UpdateState::Cancelled
        );
        if reconnectable && self.reconnects_left > 0 {
            self.reconnects_left -= 1;
            if self.try_reconnect().await {
                self.pump(ProtocolEvent::LinkReady).await;
                return;
            }
        }
        self.pump(ProtocolEvent::Disconnected).await;
    }

    /// Re-establish the dropped link. On success the protocol restarts
    /// from discovery; outcomes and timers of the old link are fenced off
    /// by the generation bump.
    async fn try_reconnect(&mut self) -> bool {
        log::warn!(
            "Link to {} dropped; reconnecting ({} attempts left)",
            self.device,
            self.reconnects_left
        );
        match tokio::time::timeout(
            self.config.reconnect_timeout,
            self.client.connect(&self.device),
        )
        .await
        {
            Ok(Ok(())) => {
                self.generation += 1;
                self.queue = GattQueue::new();
                self.engine.reset_for_retry();
                log::info!("Reconnected to {}; restarting protocol", self.device);
                true
            }
            Ok(Err(error)) => {
                log::error!("Reconnect failed: {}", error);
                false
            }
            Err(_) => {
                log::error!("Reconnect timed out");
                false
            }
        }
    }

    fn deliver(&mut self, event: UpdateEvent) {
        match &event {
            UpdateEvent::Completed => self.outcome = Some(Ok(())),
            UpdateEvent::Cancelled => self.outcome = Some(Err(DfuError::UpdateCancelled)),
            UpdateEvent::Failed { .. } => {
                let error = self
                    .engine
                    .failure()
                    .cloned()
                    .unwrap_or(DfuError::Unknown);
                self.outcome = Some(Err(error));
            }
            _ => {}
        }
        if self.reports.send(event).is_err() {
            log::debug!("Report channel closed");
        }
    }

    fn is_session_device(&self, device: &DeviceId) -> bool {
        *device == self.device
    }

    fn is_control_point(&self, characteristic: Uuid) -> bool {
        self.link
            .as_ref()
            .map(|link| link.control_point == characteristic)
            .unwrap_or(false)
    }
}
