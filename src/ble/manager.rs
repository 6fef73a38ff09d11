//! Connection manager façade.
//!
//! One manager owns one device session: the selected device, the link and
//! service handles, the per-session [`DeviceState`], the state machine,
//! and the notification queues. It enforces the central safety invariant
//! — a session is never torn down while it is the data source for an
//! active recording — and drives reconnection through the shared
//! [`RecordingRegistry`] timer.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::events::EventManager;
use super::initializer::{ChannelBinding, DeviceInitializer};
use super::picker::DevicePicker;
use super::state_machine::{ConnectionState, ConnectionStateMachine, StateEvent, StateTimeouts};
use crate::config::{ChannelKind, FamilyConfig};
use crate::data::{DeviceState, MemoryPreferredDeviceStore, PreferredDevice, PreferredDeviceStore};
use crate::error::{Error, Result};
use crate::recording::{Reconnectable, RecordingRegistry};
use crate::transport::{
    with_retry, with_timeout, BleTransport, DeviceHandle, NotificationSink, ServerHandle,
    ServiceHandle, CONNECT_ATTEMPTS, CONNECT_TIMEOUT, IO_ATTEMPTS, IO_TIMEOUT,
    NOTIFICATION_QUEUE_DEPTH,
};

/// How long one scan window lasts.
const SCAN_WINDOW: Duration = Duration::from_secs(4);
/// Outer budget for a scan call, window included.
const SCAN_TIMEOUT: Duration = Duration::from_secs(10);
/// Attempts for the device-side disconnect command.
const DISCONNECT_COMMAND_ATTEMPTS: u32 = 3;

/// Per-payload notification handler.
pub type NotificationHandler = Box<dyn FnMut(Vec<u8>) + Send>;

/// Handlers for the notification channels of a session.
///
/// The primary handler is mandatory; the others are used only when the
/// family configuration defines the matching channel.
pub struct NotificationHandlers {
    primary: Option<NotificationHandler>,
    secondary: Option<NotificationHandler>,
    battery: Option<NotificationHandler>,
    charging: Option<NotificationHandler>,
}

impl NotificationHandlers {
    /// Create handlers with the mandatory primary-data handler.
    pub fn new(primary: impl FnMut(Vec<u8>) + Send + 'static) -> Self {
        Self {
            primary: Some(Box::new(primary)),
            secondary: None,
            battery: None,
            charging: None,
        }
    }

    /// Attach a secondary-data handler.
    pub fn with_secondary(mut self, handler: impl FnMut(Vec<u8>) + Send + 'static) -> Self {
        self.secondary = Some(Box::new(handler));
        self
    }

    /// Attach a battery-push handler.
    pub fn with_battery(mut self, handler: impl FnMut(Vec<u8>) + Send + 'static) -> Self {
        self.battery = Some(Box::new(handler));
        self
    }

    /// Attach a charging-push handler.
    pub fn with_charging(mut self, handler: impl FnMut(Vec<u8>) + Send + 'static) -> Self {
        self.charging = Some(Box::new(handler));
        self
    }

    fn take(&mut self, kind: ChannelKind) -> Option<NotificationHandler> {
        match kind {
            ChannelKind::PrimaryData => self.primary.take(),
            ChannelKind::SecondaryData => self.secondary.take(),
            ChannelKind::Battery => self.battery.take(),
            ChannelKind::Charging => self.charging.take(),
        }
    }
}

/// Optional construction parameters for a [`ConnectionManager`].
pub struct ManagerOptions {
    /// Per-state deadline budgets.
    pub timeouts: StateTimeouts,
    /// The device picker to consult on ambiguous scans.
    pub picker: Arc<DevicePicker>,
    /// The preferred-device store.
    pub preferred: Arc<dyn PreferredDeviceStore>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            timeouts: StateTimeouts::default(),
            picker: Arc::new(DevicePicker::new()),
            preferred: Arc::new(MemoryPreferredDeviceStore::new()),
        }
    }
}

/// Owns one device session end to end.
pub struct ConnectionManager<T: BleTransport> {
    transport: Arc<T>,
    config: FamilyConfig,
    machine: Arc<ConnectionStateMachine>,
    recording: Arc<RecordingRegistry>,
    picker: Arc<DevicePicker>,
    preferred: Arc<dyn PreferredDeviceStore>,
    device_state: RwLock<DeviceState>,
    device: RwLock<Option<DeviceHandle>>,
    server: RwLock<Option<ServerHandle>>,
    service: RwLock<Option<ServiceHandle>>,
    bindings: RwLock<Vec<Arc<ChannelBinding>>>,
    drain_tasks: RwLock<Vec<tokio::task::JoinHandle<()>>>,
    /// Whether the session should hold (and re-acquire) its link.
    should_connect: AtomicBool,
    battery_tx: broadcast::Sender<u8>,
    charging_tx: broadcast::Sender<bool>,
    watchdog: Mutex<Option<tokio::task::JoinHandle<()>>>,
    disconnect_watch: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl<T: BleTransport> ConnectionManager<T> {
    /// Create a manager with default options and register it with the
    /// recording registry's reconnection timer.
    pub fn new(
        transport: Arc<T>,
        config: FamilyConfig,
        recording: Arc<RecordingRegistry>,
    ) -> Arc<Self> {
        Self::with_options(transport, config, recording, ManagerOptions::default())
    }

    /// Create a manager with explicit options.
    pub fn with_options(
        transport: Arc<T>,
        config: FamilyConfig,
        recording: Arc<RecordingRegistry>,
        options: ManagerOptions,
    ) -> Arc<Self> {
        let (battery_tx, _) = broadcast::channel(16);
        let (charging_tx, _) = broadcast::channel(16);

        let manager = Arc::new(Self {
            transport,
            config,
            machine: Arc::new(ConnectionStateMachine::with_timeouts(options.timeouts)),
            recording: recording.clone(),
            picker: options.picker,
            preferred: options.preferred,
            device_state: RwLock::new(DeviceState::new()),
            device: RwLock::new(None),
            server: RwLock::new(None),
            service: RwLock::new(None),
            bindings: RwLock::new(Vec::new()),
            drain_tasks: RwLock::new(Vec::new()),
            should_connect: AtomicBool::new(false),
            battery_tx,
            charging_tx,
            watchdog: Mutex::new(None),
            disconnect_watch: Mutex::new(None),
        });

        manager.spawn_state_watchdog();
        manager.spawn_disconnect_watch();

        let manager_dyn: Arc<dyn Reconnectable> = manager.clone();
        let weak: Weak<dyn Reconnectable> = Arc::downgrade(&manager_dyn);
        recording.register(weak);

        manager
    }

    // === Accessors ===

    /// The session's state machine.
    pub fn state_machine(&self) -> &ConnectionStateMachine {
        &self.machine
    }

    /// The current connection state.
    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    /// Whether the session holds a usable link.
    pub fn is_connected(&self) -> bool {
        self.machine.is_connected()
    }

    /// Whether a connection attempt is currently in flight.
    pub fn is_connecting(&self) -> bool {
        self.machine.is_connecting()
    }

    /// Subscribe to state machine events.
    pub fn subscribe_state(&self) -> broadcast::Receiver<StateEvent> {
        self.machine.subscribe()
    }

    /// Subscribe to battery level updates.
    pub fn subscribe_battery(&self) -> broadcast::Receiver<u8> {
        self.battery_tx.subscribe()
    }

    /// Subscribe to charging state updates.
    pub fn subscribe_charging(&self) -> broadcast::Receiver<bool> {
        self.charging_tx.subscribe()
    }

    /// Snapshot of the per-session device attributes.
    pub fn device_state(&self) -> DeviceState {
        self.device_state.read().clone()
    }

    /// The device picker driving ambiguous selections.
    pub fn picker(&self) -> Arc<DevicePicker> {
        self.picker.clone()
    }

    /// The currently selected device, if any.
    pub fn device(&self) -> Option<DeviceHandle> {
        self.device.read().clone()
    }

    /// The family configuration this session runs with.
    pub fn config(&self) -> &FamilyConfig {
        &self.config
    }

    // === Session lifecycle ===

    /// Scan for a device and select one.
    ///
    /// A stored preferred device present in the scan results is selected
    /// without asking the picker; otherwise ambiguous results go through
    /// the picker protocol. The machine is left in `Scanning`, ready for
    /// [`ConnectionManager::connect`].
    pub async fn request_device(&self) -> Result<DeviceHandle> {
        // A repeated request while still scanning is a re-scan, not a
        // table violation.
        if self.machine.state() != ConnectionState::Scanning
            && !self
                .machine
                .transition_with_context(ConnectionState::Scanning, "device requested")
        {
            return Err(Error::InvalidTransition {
                from: self.machine.state().to_string(),
                to: ConnectionState::Scanning.to_string(),
            });
        }

        match self.scan_and_select().await {
            Ok(device) => {
                info!("selected device {} ({:?})", device.id, device.name);
                *self.device.write() = Some(device.clone());
                Ok(device)
            }
            Err(e) => {
                self.machine.transition_to_error(&e);
                Err(e)
            }
        }
    }

    async fn scan_and_select(&self) -> Result<DeviceHandle> {
        let candidates = with_retry("scan", IO_ATTEMPTS, || {
            with_timeout(
                SCAN_TIMEOUT,
                "scan",
                self.transport.scan(&self.config.scan_filter, SCAN_WINDOW),
            )
        })
        .await?;

        if candidates.is_empty() {
            return Err(Error::DeviceNotFound {
                identifier: self.config.family.to_string(),
            });
        }

        if let Some(preferred) = self.preferred.load() {
            if let Some(hit) = candidates.iter().find(|c| c.id == preferred.device_id) {
                info!(
                    "preferred device {} present, skipping picker",
                    preferred.device_id
                );
                return Ok(hit.clone());
            }
        }

        self.picker.select(candidates).await
    }

    /// Establish the link to the selected device.
    ///
    /// A call while a connection attempt is already in flight
    /// short-circuits, so two callers can never race duplicate attempts
    /// at the same device.
    pub async fn connect(&self) -> Result<()> {
        if self.machine.is_connecting() {
            debug!("connection already in progress, ignoring connect request");
            return Ok(());
        }
        if self.machine.is_connected() {
            debug!("already connected");
            return Ok(());
        }

        let device = self.device.read().clone().ok_or(Error::ConnectionFailed {
            reason: "no device selected".to_string(),
        })?;

        if !self.machine.transition(ConnectionState::Connecting) {
            return Err(Error::InvalidTransition {
                from: self.machine.state().to_string(),
                to: ConnectionState::Connecting.to_string(),
            });
        }

        self.should_connect.store(true, Ordering::SeqCst);

        let attempt = with_retry("connect", CONNECT_ATTEMPTS, || {
            with_timeout(CONNECT_TIMEOUT, "connect", self.transport.connect(&device))
        })
        .await;

        match attempt {
            Ok(server) => {
                *self.server.write() = Some(server);
                Ok(())
            }
            Err(e) => {
                self.machine.transition_to_error(&e);
                Err(e)
            }
        }
    }

    /// Discover, read static attributes, and subscribe notifications.
    ///
    /// On success the machine lands in `Connected`, or `PartialConnected`
    /// when a non-critical channel could not be subscribed, and the
    /// preferred-device record is written.
    pub async fn initialize_device(&self, mut handlers: NotificationHandlers) -> Result<DeviceState> {
        let server = self.server.read().clone().ok_or(Error::NotConnected)?;

        if !self.machine.transition(ConnectionState::Initializing) {
            return Err(Error::InvalidTransition {
                from: self.machine.state().to_string(),
                to: ConnectionState::Initializing.to_string(),
            });
        }

        let mut bindings = Vec::new();
        let mut tasks = Vec::new();
        for spec in &self.config.channels {
            let Some(mut handler) = handlers.take(spec.kind) else {
                if spec.critical {
                    let error = Error::SubscriptionFailed {
                        channel: spec.kind.name().to_string(),
                        reason: "no handler provided for critical channel".to_string(),
                    };
                    self.machine.transition_to_error(&error);
                    return Err(error);
                }
                debug!("no handler for {} channel, skipping", spec.kind.name());
                continue;
            };

            let (sink, mut rx) = NotificationSink::channel(NOTIFICATION_QUEUE_DEPTH);
            let kind = spec.kind;
            // One drain task per characteristic: payloads are processed
            // synchronously in arrival order, never reordered.
            tasks.push(tokio::spawn(async move {
                while let Some(payload) = rx.recv().await {
                    handler(payload);
                }
                debug!("{} drain task ended", kind.name());
            }));

            bindings.push(Arc::new(ChannelBinding {
                spec: spec.clone(),
                sink,
                characteristic: RwLock::new(None),
            }));
        }

        let initializer = DeviceInitializer::new(self.transport.as_ref(), &self.config);
        match initializer.initialize(&server, &bindings).await {
            Ok(outcome) => {
                *self.device_state.write() = outcome.state.clone();
                *self.service.write() = Some(outcome.service);
                *self.bindings.write() = bindings;
                {
                    let mut drain = self.drain_tasks.write();
                    for stale in drain.drain(..) {
                        stale.abort();
                    }
                    drain.extend(tasks);
                }

                let target = if outcome.degraded {
                    ConnectionState::PartialConnected
                } else {
                    ConnectionState::Connected
                };
                self.machine.transition_with_context(
                    target,
                    if outcome.degraded {
                        "non-critical channel(s) unavailable"
                    } else {
                        "all channels subscribed"
                    },
                );

                self.store_preferred();
                Ok(outcome.state)
            }
            Err(e) => {
                for task in tasks {
                    task.abort();
                }
                self.machine.transition_to_error(&e);
                Err(e)
            }
        }
    }

    /// Tear down the session.
    ///
    /// While either recording flag is set and `force` is not, the call is
    /// refused with `Ok(false)` before any transport activity — a session
    /// must not disappear under an active recording. The device-side
    /// disconnect command (when the family defines one) is attempted a
    /// fixed number of times, but local teardown proceeds whether or not
    /// the device ever acknowledges it.
    pub async fn disconnect(&self, force: bool) -> Result<bool> {
        if self.recording.is_recording() && !force {
            warn!("disconnect refused: a recording is active");
            return Ok(false);
        }

        self.should_connect.store(false, Ordering::SeqCst);

        let state = self.machine.state();
        match state {
            ConnectionState::Idle | ConnectionState::Disconnecting => {
                debug!("nothing to disconnect in state {}", state);
                return Ok(true);
            }
            ConnectionState::Connected
            | ConnectionState::PartialConnected
            | ConnectionState::Initializing => {
                self.machine.transition_with_context(
                    ConnectionState::Disconnecting,
                    if force { "forced disconnect" } else { "disconnect requested" },
                );
                self.send_disconnect_command().await;
                self.teardown_link().await;
                self.machine.transition(ConnectionState::Idle);
            }
            _ => {
                self.machine
                    .transition_with_context(ConnectionState::Idle, "disconnect requested");
            }
        }

        self.clear_session();
        Ok(true)
    }

    /// Write the mode byte with the disconnect bit set, retrying a fixed
    /// number of times. Device non-acknowledgement never blocks local
    /// cleanup.
    async fn send_disconnect_command(&self) {
        let Some(command) = self.config.disconnect_command else {
            return;
        };
        let Some(service) = self.service.read().clone() else {
            return;
        };

        let mode = self.device_state.read().mode_raw | command.mode_bit;

        for attempt in 1..=DISCONNECT_COMMAND_ATTEMPTS {
            let result = async {
                let characteristic = self
                    .transport
                    .characteristic(&service, command.characteristic)
                    .await?;
                with_timeout(
                    IO_TIMEOUT,
                    "disconnect command",
                    self.transport.write(&characteristic, &[mode]),
                )
                .await
            }
            .await;

            match result {
                Ok(()) => {
                    debug!("device acknowledged disconnect command");
                    return;
                }
                Err(e) => warn!(
                    "disconnect command attempt {}/{} failed: {}",
                    attempt, DISCONNECT_COMMAND_ATTEMPTS, e
                ),
            }
        }

        warn!("device never acknowledged disconnect command, tearing down locally");
    }

    async fn teardown_link(&self) {
        let server = self.server.read().clone();
        if let Some(server) = server {
            if let Err(e) = self.transport.disconnect(&server).await {
                warn!("transport disconnect failed: {}", e);
            }
        }
    }

    fn clear_session(&self) {
        *self.server.write() = None;
        *self.service.write() = None;
        *self.device.write() = None;
        for task in self.drain_tasks.write().drain(..) {
            task.abort();
        }
        self.bindings.write().clear();
        self.device_state.write().reset();
    }

    /// Handle an unexpected link loss reported by the transport.
    ///
    /// With a recording active the session moves to `Reconnecting` and
    /// keeps its handles for the shared timer's next attempt; otherwise
    /// it settles in `Idle` with everything cleared.
    pub async fn on_disconnected(&self) {
        let state = self.machine.state();
        if matches!(
            state,
            ConnectionState::Idle | ConnectionState::Disconnecting
        ) {
            debug!("link drop during teardown, ignoring");
            return;
        }

        if self.recording.is_recording() && self.should_connect.load(Ordering::SeqCst) {
            warn!("link lost while recording, scheduling reconnection");
            self.machine
                .transition_with_context(ConnectionState::Reconnecting, "link lost while recording");
        } else {
            info!("link lost, session going idle");
            self.should_connect.store(false, Ordering::SeqCst);
            match self.machine.state() {
                ConnectionState::Connected
                | ConnectionState::PartialConnected
                | ConnectionState::Initializing => {
                    self.machine
                        .transition_with_context(ConnectionState::Disconnecting, "link lost");
                    self.machine.transition(ConnectionState::Idle);
                }
                _ => {
                    self.machine
                        .transition_with_context(ConnectionState::Idle, "link lost");
                }
            }
            self.clear_session();
        }
    }

    /// Re-subscribe notification listeners on the existing handles.
    ///
    /// Used after a silent GATT-level reconnection where the prior
    /// session's handles are still structurally valid. Falls back to
    /// re-resolving the primary service when no handle survives.
    pub async fn reestablish_event_listeners(&self) -> Result<DeviceState> {
        let server = self.server.read().clone().ok_or(Error::NotConnected)?;
        let bindings = self.bindings.read().clone();
        if bindings.is_empty() {
            return Err(Error::NotConnected);
        }

        let existing_service = self.service.read().clone();
        let service = match existing_service {
            Some(service) => service,
            None => {
                DeviceInitializer::new(self.transport.as_ref(), &self.config)
                    .resolve_primary_service(&server)
                    .await?
            }
        };

        let degraded = EventManager::new(self.transport.as_ref())
            .reestablish(&service, &bindings)
            .await?;
        *self.service.write() = Some(service);

        if self.machine.state() == ConnectionState::Initializing {
            let target = if degraded {
                ConnectionState::PartialConnected
            } else {
                ConnectionState::Connected
            };
            self.machine
                .transition_with_context(target, "listeners re-established");
        }

        Ok(self.device_state.read().clone())
    }

    // === Device state updates ===

    /// Record a battery level report and notify subscribers.
    pub fn update_battery(&self, percent: u8) {
        let percent = percent.min(100);
        self.device_state.write().battery = percent;
        let _ = self.battery_tx.send(percent);
    }

    /// Record a charging state report and notify subscribers.
    pub fn update_charging(&self, charging: bool) {
        self.device_state.write().charging = charging;
        let _ = self.charging_tx.send(charging);
    }

    /// Record the protocol-assigned session identifier, first writer
    /// wins.
    pub fn note_session_id(&self, session_id: impl Into<String>) {
        let mut state = self.device_state.write();
        if state.session_id.is_empty() {
            state.session_id = session_id.into();
        }
    }

    // === Internals ===

    fn store_preferred(&self) {
        if let Some(device) = self.device.read().clone() {
            self.preferred.save(&PreferredDevice {
                device_id: device.id,
                display_name: device
                    .name
                    .unwrap_or_else(|| self.config.family.to_string()),
                last_connected_at: Utc::now(),
            });
        }
    }

    /// Reconnect after an unexpected link loss, driven by the registry
    /// timer.
    async fn reconnect_once(&self) -> Result<()> {
        match self.machine.state() {
            ConnectionState::Error => {
                if !self
                    .machine
                    .transition_with_context(ConnectionState::Reconnecting, "retry after error")
                {
                    return Ok(());
                }
            }
            ConnectionState::Reconnecting => {}
            // Connected, mid-flight, or idle: nothing for the timer to do.
            _ => return Ok(()),
        }

        let device = self.device.read().clone().ok_or(Error::ConnectionFailed {
            reason: "no device to reconnect to".to_string(),
        })?;

        if !self.machine.transition(ConnectionState::Connecting) {
            return Ok(());
        }

        let attempt = with_retry("reconnect", CONNECT_ATTEMPTS, || {
            with_timeout(CONNECT_TIMEOUT, "connect", self.transport.connect(&device))
        })
        .await;

        match attempt {
            Ok(server) => {
                *self.server.write() = Some(server);
            }
            Err(e) => {
                self.machine.transition_to_error(&e);
                return Err(e);
            }
        }

        self.machine.transition(ConnectionState::Initializing);
        match self.reestablish_event_listeners().await {
            Ok(_) => {
                info!("session re-established after link loss");
                Ok(())
            }
            Err(e) => {
                // The stored service handle may be stale; drop it so the
                // next attempt re-resolves from scratch.
                *self.service.write() = None;
                self.machine.transition_to_error(&e);
                Err(e)
            }
        }
    }

    /// Fire `transition_to_error` when a state outlives its deadline.
    fn spawn_state_watchdog(self: &Arc<Self>) {
        let machine = Arc::downgrade(&self.machine);

        let handle = tokio::spawn(async move {
            loop {
                let Some(machine) = machine.upgrade() else {
                    break;
                };

                let notified = machine.changed();
                tokio::pin!(notified);
                notified.as_mut().enable();

                match machine.deadline() {
                    Some(at) => {
                        tokio::select! {
                            _ = tokio::time::sleep_until(at.into()) => {
                                // Same deadline still pending means no
                                // transition happened in between.
                                if machine.deadline() == Some(at) {
                                    let state = machine.state();
                                    warn!("state {} exceeded its budget", state);
                                    machine.transition_to_error(&Error::Timeout {
                                        operation: format!("state {state}"),
                                    });
                                }
                            }
                            _ = notified.as_mut() => {}
                        }
                    }
                    None => notified.await,
                }
            }
        });

        *self.watchdog.lock() = Some(handle);
    }

    /// Route transport disconnect events for our device to
    /// [`ConnectionManager::on_disconnected`].
    fn spawn_disconnect_watch(self: &Arc<Self>) {
        let mut events = self.transport.disconnect_events();
        let weak = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(device_id) => {
                        let Some(manager) = weak.upgrade() else {
                            break;
                        };
                        let ours = manager
                            .device
                            .read()
                            .as_ref()
                            .map(|d| d.id == device_id)
                            .unwrap_or(false);
                        if ours {
                            manager.on_disconnected().await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("disconnect event watch lagged by {} events", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        *self.disconnect_watch.lock() = Some(handle);
    }
}

#[async_trait]
impl<T: BleTransport> Reconnectable for ConnectionManager<T> {
    fn label(&self) -> String {
        self.config.family.to_string()
    }

    fn is_connected(&self) -> bool {
        self.machine.is_connected()
    }

    fn wants_reconnect(&self) -> bool {
        self.should_connect.load(Ordering::SeqCst)
            && matches!(
                self.machine.state(),
                ConnectionState::Reconnecting | ConnectionState::Error
            )
    }

    async fn reconnect(&self) -> Result<()> {
        self.reconnect_once().await
    }
}

impl<T: BleTransport> Drop for ConnectionManager<T> {
    fn drop(&mut self) {
        if let Some(task) = self.watchdog.lock().take() {
            task.abort();
        }
        if let Some(task) = self.disconnect_watch.lock().take() {
            task.abort();
        }
        for task in self.drain_tasks.write().drain(..) {
            task.abort();
        }
    }
}
