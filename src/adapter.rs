//! Sensor adapter façade.
//!
//! A [`DeviceAdapter`] binds one [`ConnectionManager`] to one payload
//! decoder, exposing the uniform [`SensorAdapter`] contract to
//! application code. Families differ only in the configuration and
//! decoder passed to the constructor; the session logic is shared, never
//! duplicated per family.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::trace;

use crate::ble::manager::{ConnectionManager, NotificationHandlers};
use crate::ble::picker::DevicePicker;
use crate::ble::state_machine::ConnectionState;
use crate::config::{Capabilities, DeviceFamily, FamilyConfig, TextLayout};
use crate::data::{DeviceState, SensorReading};
use crate::error::Result;
use crate::protocol::{pmscan, AirBeamDecoder, FrameDecoder, PmScanDecoder};
use crate::recording::RecordingRegistry;
use crate::transport::{BleTransport, DeviceHandle};

/// Callback handle for unregistering callbacks.
///
/// Dropping the handle unregisters the callback.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

/// Uniform sensor-adapter contract, independent of device family.
#[async_trait]
pub trait SensorAdapter: Send + Sync {
    /// The device family this adapter drives.
    fn family(&self) -> DeviceFamily;

    /// Scan for and select a device.
    async fn request_device(&self) -> Result<DeviceHandle>;

    /// Establish the link to the selected device.
    async fn connect(&self) -> Result<()>;

    /// Initialize the device and wire up notification decoding.
    async fn initialize_notifications(&self) -> Result<DeviceState>;

    /// Tear down the session. Refused (`Ok(false)`) without `force`
    /// while a recording is active.
    async fn disconnect(&self, force: bool) -> Result<bool>;

    /// The current connection state.
    fn connection_state(&self) -> ConnectionState;

    /// The most recent decoded reading, if any.
    fn live_reading(&self) -> Option<SensorReading>;

    /// Snapshot of the per-session device attributes.
    fn device_state(&self) -> DeviceState;

    /// Record an externally observed battery level.
    fn update_battery(&self, percent: u8);

    /// Record an externally observed charging state.
    fn update_charging(&self, charging: bool);

    /// Whether readings from this family may carry pressure.
    fn supports_pressure(&self) -> bool;

    /// Whether readings from this family may carry a TVOC index.
    fn supports_tvoc(&self) -> bool;
}

/// Generic adapter implementation over any transport.
pub struct DeviceAdapter<T: BleTransport> {
    manager: Arc<ConnectionManager<T>>,
    decoder: Arc<Mutex<dyn FrameDecoder>>,
    family: DeviceFamily,
    capabilities: Capabilities,
    reading_tx: broadcast::Sender<SensorReading>,
    last_reading: Arc<RwLock<Option<SensorReading>>>,
    location_label: Arc<RwLock<Option<String>>>,
    callback_counter: AtomicU64,
}

impl<T: BleTransport> DeviceAdapter<T> {
    /// Create an adapter for a PMScan device.
    pub fn pmscan(transport: Arc<T>, recording: Arc<RecordingRegistry>) -> Arc<Self> {
        Self::from_parts(
            transport,
            recording,
            FamilyConfig::pmscan(),
            Arc::new(Mutex::new(PmScanDecoder::new())),
        )
    }

    /// Create an adapter for an AirBeam device.
    pub fn airbeam(transport: Arc<T>, recording: Arc<RecordingRegistry>) -> Arc<Self> {
        let config = FamilyConfig::airbeam();
        let layout = config.text_layout.unwrap_or_else(TextLayout::default);
        Self::from_parts(
            transport,
            recording,
            config,
            Arc::new(Mutex::new(AirBeamDecoder::new(layout))),
        )
    }

    /// Create an adapter from an explicit configuration and decoder.
    pub fn from_parts(
        transport: Arc<T>,
        recording: Arc<RecordingRegistry>,
        config: FamilyConfig,
        decoder: Arc<Mutex<dyn FrameDecoder>>,
    ) -> Arc<Self> {
        let family = config.family;
        let capabilities = config.capabilities;
        let manager = ConnectionManager::new(transport, config, recording);
        let (reading_tx, _) = broadcast::channel(64);

        Arc::new(Self {
            manager,
            decoder,
            family,
            capabilities,
            reading_tx,
            last_reading: Arc::new(RwLock::new(None)),
            location_label: Arc::new(RwLock::new(None)),
            callback_counter: AtomicU64::new(0),
        })
    }

    /// The underlying connection manager.
    pub fn manager(&self) -> &Arc<ConnectionManager<T>> {
        &self.manager
    }

    /// The device picker driving ambiguous selections.
    pub fn picker(&self) -> Arc<DevicePicker> {
        self.manager.picker()
    }

    /// Set the location label stamped onto emitted readings.
    pub fn set_location_label(&self, label: Option<String>) {
        *self.location_label.write() = label;
    }

    /// Subscribe to decoded readings.
    pub fn subscribe_readings(&self) -> broadcast::Receiver<SensorReading> {
        self.reading_tx.subscribe()
    }

    /// Register a callback fired once per decoded reading.
    pub fn on_reading<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(SensorReading) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.reading_tx.subscribe();

        let handle = tokio::spawn(async move {
            while let Ok(reading) = rx.recv().await {
                callback(reading);
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Register a callback fired on battery level updates.
    pub fn on_battery<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.manager.subscribe_battery();

        let handle = tokio::spawn(async move {
            while let Ok(percent) = rx.recv().await {
                callback(percent);
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Build the notification handlers wiring payloads to the decoder
    /// and the session state.
    fn build_handlers(&self) -> NotificationHandlers {
        let handlers = NotificationHandlers::new(self.frame_handler(false));

        let handlers = handlers.with_secondary(self.frame_handler(true));

        let battery_manager = self.manager.clone();
        let handlers = handlers.with_battery(move |payload: Vec<u8>| {
            if let Some(&percent) = payload.first() {
                battery_manager.update_battery(percent);
            } else {
                trace!("empty battery notification");
            }
        });

        let charging_manager = self.manager.clone();
        handlers.with_charging(move |payload: Vec<u8>| {
            if let Some(&flag) = payload.first() {
                charging_manager.update_charging(flag != 0);
            } else {
                trace!("empty charging notification");
            }
        })
    }

    /// Handler decoding measurement frames from the primary or secondary
    /// channel.
    fn frame_handler(&self, replay: bool) -> impl FnMut(Vec<u8>) + Send + 'static {
        let decoder = self.decoder.clone();
        let manager = self.manager.clone();
        let reading_tx = self.reading_tx.clone();
        let last_reading = self.last_reading.clone();
        let location_label = self.location_label.clone();
        let family = self.family;

        move |payload: Vec<u8>| {
            if family == DeviceFamily::PmScan {
                if let Some(counter) = pmscan::frame_counter(&payload) {
                    manager.note_session_id(format!("{counter:08X}"));
                }
            }

            let readings = decoder.lock().decode(&payload);
            if replay && !readings.is_empty() {
                trace!("{} stored-sample frame(s) replayed", readings.len());
            }

            for reading in readings {
                let state = manager.device_state();
                let reading = reading
                    .with_power(state.battery, state.charging)
                    .with_location(location_label.read().clone());

                *last_reading.write() = Some(reading.clone());
                let _ = reading_tx.send(reading);
            }
        }
    }
}

#[async_trait]
impl<T: BleTransport> SensorAdapter for DeviceAdapter<T> {
    fn family(&self) -> DeviceFamily {
        self.family
    }

    async fn request_device(&self) -> Result<DeviceHandle> {
        self.manager.request_device().await
    }

    async fn connect(&self) -> Result<()> {
        self.manager.connect().await
    }

    async fn initialize_notifications(&self) -> Result<DeviceState> {
        self.manager.initialize_device(self.build_handlers()).await
    }

    async fn disconnect(&self, force: bool) -> Result<bool> {
        self.manager.disconnect(force).await
    }

    fn connection_state(&self) -> ConnectionState {
        self.manager.state()
    }

    fn live_reading(&self) -> Option<SensorReading> {
        self.last_reading.read().clone()
    }

    fn device_state(&self) -> DeviceState {
        self.manager.device_state()
    }

    fn update_battery(&self, percent: u8) {
        self.manager.update_battery(percent);
    }

    fn update_charging(&self, charging: bool) {
        self.manager.update_charging(charging);
    }

    fn supports_pressure(&self) -> bool {
        self.capabilities.pressure
    }

    fn supports_tvoc(&self) -> bool {
        self.capabilities.tvoc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::*;
    use crate::transport::testing::{wait_until, FakeTransport};
    use std::time::Duration;

    fn pmscan_fake() -> Arc<FakeTransport> {
        let fake = FakeTransport::new();
        fake.add_device("dev-1", "PMScan 1234", -48);
        fake.services.lock().push(PMSCAN_SERVICE_UUID);
        fake.read_values.lock().insert(PMSCAN_BATTERY_UUID, vec![76]);
        fake.read_values.lock().insert(PMSCAN_MODE_UUID, vec![0x01]);
        fake.read_values
            .lock()
            .insert(PMSCAN_CLOCK_UUID, 1_000u32.to_le_bytes().to_vec());
        Arc::new(fake)
    }

    fn airbeam_fake() -> Arc<FakeTransport> {
        let fake = FakeTransport::new();
        fake.add_device("ab-1", "AirBeam3 0001", -60);
        fake.services.lock().push(AIRBEAM_SERVICE_UUID);
        Arc::new(fake)
    }

    fn pmscan_frame(counter: u32) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&counter.to_le_bytes());
        frame.extend_from_slice(&1200u16.to_le_bytes());
        frame.extend_from_slice(&2500u16.to_le_bytes());
        frame.extend_from_slice(&4500u16.to_le_bytes());
        frame.extend_from_slice(&221i16.to_le_bytes());
        frame.extend_from_slice(&551u16.to_le_bytes());
        frame
    }

    async fn connected<T: BleTransport>(adapter: &Arc<DeviceAdapter<T>>) {
        adapter.request_device().await.expect("device selected");
        adapter.connect().await.expect("connect succeeds");
        adapter
            .initialize_notifications()
            .await
            .expect("initialization succeeds");
    }

    #[tokio::test]
    async fn test_pmscan_end_to_end() {
        let fake = pmscan_fake();
        let recording = RecordingRegistry::new();
        let adapter = DeviceAdapter::pmscan(fake.clone(), recording);

        connected(&adapter).await;
        assert_eq!(adapter.connection_state(), ConnectionState::Connected);

        let mut readings = adapter.subscribe_readings();
        adapter.set_location_label(Some("balcony".to_string()));

        fake.emit(PMSCAN_REALTIME_DATA_UUID, pmscan_frame(42));

        let reading = readings.recv().await.expect("reading arrives");
        assert_eq!(reading.pm1, 120.0);
        assert_eq!(reading.pm2_5, 250.0);
        assert_eq!(reading.pm10, 450.0);
        assert_eq!(reading.temperature, 22.1);
        assert_eq!(reading.humidity, 55.1);
        assert_eq!(reading.battery, 76, "stamped from device state");
        assert_eq!(reading.location_label.as_deref(), Some("balcony"));

        // The first frame's counter names the session.
        assert_eq!(adapter.device_state().session_id, "0000002A");
        assert!(adapter.live_reading().is_some());
    }

    #[tokio::test]
    async fn test_pmscan_capabilities() {
        let fake = pmscan_fake();
        let recording = RecordingRegistry::new();
        let adapter = DeviceAdapter::pmscan(fake, recording);
        assert_eq!(adapter.family(), DeviceFamily::PmScan);
        assert!(adapter.supports_pressure());
        assert!(adapter.supports_tvoc());
    }

    #[tokio::test]
    async fn test_corrupt_frame_is_dropped_session_continues() {
        let fake = pmscan_fake();
        let recording = RecordingRegistry::new();
        let adapter = DeviceAdapter::pmscan(fake.clone(), recording);
        connected(&adapter).await;

        let collected = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = collected.clone();
        let _handle = adapter.on_reading(move |reading| sink.lock().push(reading.pm2_5));

        // Too short to decode, then a good frame.
        fake.emit(PMSCAN_REALTIME_DATA_UUID, vec![0x01, 0x02]);
        fake.emit(PMSCAN_REALTIME_DATA_UUID, pmscan_frame(7));

        assert!(wait_until(Duration::from_secs(1), || collected.lock().len() == 1).await);
        assert_eq!(*collected.lock(), vec![250.0]);
        assert!(adapter.connection_state().is_connected());
    }

    #[tokio::test]
    async fn test_battery_push_updates_state_and_next_reading() {
        let fake = pmscan_fake();
        let recording = RecordingRegistry::new();
        let adapter = DeviceAdapter::pmscan(fake.clone(), recording);
        connected(&adapter).await;

        let battery_seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = battery_seen.clone();
        let _handle = adapter.on_battery(move |percent| sink.lock().push(percent));

        fake.emit(PMSCAN_BATTERY_UUID, vec![34]);
        assert!(
            wait_until(Duration::from_secs(1), || adapter.device_state().battery == 34).await
        );
        assert!(
            wait_until(Duration::from_secs(1), || *battery_seen.lock() == vec![34u8]).await
        );

        fake.emit(PMSCAN_CHARGING_UUID, vec![1]);
        assert!(wait_until(Duration::from_secs(1), || adapter.device_state().charging).await);

        let mut readings = adapter.subscribe_readings();
        fake.emit(PMSCAN_REALTIME_DATA_UUID, pmscan_frame(1));
        let reading = readings.recv().await.expect("reading arrives");
        assert_eq!(reading.battery, 34);
        assert!(reading.charging);
    }

    #[tokio::test]
    async fn test_airbeam_end_to_end_with_split_frames() {
        let fake = airbeam_fake();
        let recording = RecordingRegistry::new();
        let adapter = DeviceAdapter::airbeam(fake.clone(), recording);
        connected(&adapter).await;

        assert_eq!(adapter.family(), DeviceFamily::AirBeam);
        assert!(!adapter.supports_pressure());
        assert!(!adapter.supports_tvoc());

        let mut readings = adapter.subscribe_readings();

        // One textual frame split across notification packets.
        fake.emit(AIRBEAM_DATA_UUID, b"12345 AB3 21.7".to_vec());
        fake.emit(AIRBEAM_DATA_UUID, b" 48.2 3.1 5.4 8.9\n".to_vec());

        let reading = readings.recv().await.expect("reading arrives");
        assert_eq!(reading.temperature, 21.7);
        assert_eq!(reading.pm2_5, 5.4);
        // AirBeam exposes no battery source; the protocol default holds.
        assert_eq!(reading.battery, 100);
        assert!(adapter.device_state().session_id.is_empty());
    }

    #[tokio::test]
    async fn test_callback_handle_unregisters() {
        let fake = pmscan_fake();
        let recording = RecordingRegistry::new();
        let adapter = DeviceAdapter::pmscan(fake.clone(), recording);
        connected(&adapter).await;

        let collected = Arc::new(parking_lot::Mutex::new(0usize));
        let sink = collected.clone();
        let handle = adapter.on_reading(move |_| *sink.lock() += 1);

        fake.emit(PMSCAN_REALTIME_DATA_UUID, pmscan_frame(1));
        assert!(wait_until(Duration::from_secs(1), || *collected.lock() == 1).await);

        handle.unregister();
        fake.emit(PMSCAN_REALTIME_DATA_UUID, pmscan_frame(2));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*collected.lock(), 1, "no delivery after unregister");
    }
}
