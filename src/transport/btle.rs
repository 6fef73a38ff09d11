//! btleplug-backed transport implementation.
//!
//! Maps the plain-data transport handles onto btleplug peripherals. One
//! notification pump task per connected peripheral routes incoming
//! notifications to the per-characteristic sinks; central events feed the
//! unexpected-disconnect stream.

use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::{
    BleTransport, CharacteristicHandle, DeviceHandle, NotificationSink, ScanFilter, ServerHandle,
    ServiceHandle,
};
use crate::error::{Error, Result};
use async_trait::async_trait;

/// Production [`BleTransport`] over btleplug.
pub struct BtlePlugTransport {
    /// The BLE adapter used for scanning and connections.
    adapter: Adapter,
    /// Peripherals seen during scanning, keyed by identifier.
    peripherals: Arc<RwLock<HashMap<String, Peripheral>>>,
    /// Notification sinks keyed by (device id, characteristic UUID).
    sinks: Arc<RwLock<HashMap<(String, Uuid), NotificationSink>>>,
    /// Devices with a running notification pump task.
    pumps: Arc<RwLock<HashMap<String, tokio::task::JoinHandle<()>>>>,
    /// Unexpected-disconnect events.
    disconnect_tx: broadcast::Sender<String>,
    /// Central event watcher task.
    event_task: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl BtlePlugTransport {
    /// Create a transport on the first available Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Create a transport on a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        let (disconnect_tx, _) = broadcast::channel(16);

        let transport = Self {
            adapter,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            sinks: Arc::new(RwLock::new(HashMap::new())),
            pumps: Arc::new(RwLock::new(HashMap::new())),
            disconnect_tx,
            event_task: RwLock::new(None),
        };
        transport.spawn_event_watch();
        transport
    }

    /// Watch central events for unexpected disconnections.
    fn spawn_event_watch(&self) {
        let adapter = self.adapter.clone();
        let disconnect_tx = self.disconnect_tx.clone();
        let pumps = self.pumps.clone();

        let handle = tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to get adapter events: {}", e);
                    return;
                }
            };

            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    let device_id = id.to_string();
                    debug!("Device disconnected: {}", device_id);
                    if let Some(pump) = pumps.write().remove(&device_id) {
                        pump.abort();
                    }
                    let _ = disconnect_tx.send(device_id);
                }
            }

            debug!("Central event watch ended");
        });

        *self.event_task.write() = Some(handle);
    }

    fn peripheral(&self, device_id: &str) -> Result<Peripheral> {
        self.peripherals
            .read()
            .get(device_id)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound {
                identifier: device_id.to_string(),
            })
    }

    /// Find the btleplug characteristic struct backing a handle.
    fn resolve_characteristic(
        peripheral: &Peripheral,
        handle: &CharacteristicHandle,
    ) -> Result<Characteristic> {
        peripheral
            .services()
            .into_iter()
            .filter(|s| s.uuid == handle.service)
            .flat_map(|s| s.characteristics)
            .find(|c| c.uuid == handle.uuid)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: handle.uuid.to_string(),
            })
    }

    /// Start the notification pump for a device if not already running.
    fn ensure_pump(&self, device_id: &str, peripheral: &Peripheral) {
        let mut pumps = self.pumps.write();
        if pumps.contains_key(device_id) {
            return;
        }

        let peripheral = peripheral.clone();
        let sinks = self.sinks.clone();
        let id = device_id.to_string();

        let handle = tokio::spawn(async move {
            let mut notifications = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to get notification stream: {}", e);
                    return;
                }
            };

            debug!("Notification pump started for {}", id);

            while let Some(notification) = notifications.next().await {
                trace!(
                    "Notification from {} characteristic {}: {} bytes",
                    id,
                    notification.uuid,
                    notification.value.len()
                );

                let sink = sinks
                    .read()
                    .get(&(id.clone(), notification.uuid))
                    .cloned();
                if let Some(sink) = sink {
                    sink.deliver(notification.value);
                }
            }

            debug!("Notification pump ended for {}", id);
        });

        pumps.insert(device_id.to_string(), handle);
    }
}

#[async_trait]
impl BleTransport for BtlePlugTransport {
    async fn scan(&self, filter: &ScanFilter, window: Duration) -> Result<Vec<DeviceHandle>> {
        let scan_filter = btleplug::api::ScanFilter {
            services: filter.service.into_iter().collect(),
        };

        self.adapter
            .start_scan(scan_filter)
            .await
            .map_err(Error::Bluetooth)?;

        tokio::time::sleep(window).await;

        let peripherals = self.adapter.peripherals().await.map_err(Error::Bluetooth)?;

        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }

        let mut discovered = Vec::new();
        for peripheral in peripherals {
            let properties = match peripheral.properties().await {
                Ok(Some(p)) => p,
                _ => continue,
            };

            if let Some(prefix) = &filter.name_prefix {
                let matches = properties
                    .local_name
                    .as_ref()
                    .map(|n| n.starts_with(prefix.as_str()))
                    .unwrap_or(false);
                if !matches {
                    continue;
                }
            }

            let id = peripheral.id().to_string();
            self.peripherals.write().insert(id.clone(), peripheral);

            discovered.push(DeviceHandle {
                id,
                name: properties.local_name,
                rssi: properties.rssi,
            });
        }

        debug!("Scan found {} matching device(s)", discovered.len());
        Ok(discovered)
    }

    async fn connect(&self, device: &DeviceHandle) -> Result<ServerHandle> {
        let peripheral = self.peripheral(&device.id)?;

        if !peripheral.is_connected().await.unwrap_or(false) {
            peripheral.connect().await.map_err(Error::Bluetooth)?;
        } else {
            debug!("Peripheral already connected at BLE level");
        }

        peripheral
            .discover_services()
            .await
            .map_err(Error::Bluetooth)?;

        info!("Connected to {}", device.id);

        Ok(ServerHandle {
            device_id: device.id.clone(),
        })
    }

    async fn service(&self, server: &ServerHandle, uuid: Uuid) -> Result<ServiceHandle> {
        let peripheral = self.peripheral(&server.device_id)?;

        peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == uuid)
            .map(|s| ServiceHandle {
                device_id: server.device_id.clone(),
                uuid: s.uuid,
            })
            .ok_or_else(|| Error::ServiceNotFound {
                uuid: uuid.to_string(),
            })
    }

    async fn services(&self, server: &ServerHandle) -> Result<Vec<ServiceHandle>> {
        let peripheral = self.peripheral(&server.device_id)?;

        Ok(peripheral
            .services()
            .into_iter()
            .map(|s| ServiceHandle {
                device_id: server.device_id.clone(),
                uuid: s.uuid,
            })
            .collect())
    }

    async fn characteristic(
        &self,
        service: &ServiceHandle,
        uuid: Uuid,
    ) -> Result<CharacteristicHandle> {
        let peripheral = self.peripheral(&service.device_id)?;

        peripheral
            .services()
            .into_iter()
            .filter(|s| s.uuid == service.uuid)
            .flat_map(|s| s.characteristics)
            .find(|c| c.uuid == uuid)
            .map(|c| CharacteristicHandle {
                device_id: service.device_id.clone(),
                service: service.uuid,
                uuid: c.uuid,
            })
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: uuid.to_string(),
            })
    }

    async fn read(&self, characteristic: &CharacteristicHandle) -> Result<Vec<u8>> {
        let peripheral = self.peripheral(&characteristic.device_id)?;
        let target = Self::resolve_characteristic(&peripheral, characteristic)?;

        let data = peripheral.read(&target).await.map_err(Error::Bluetooth)?;
        trace!(
            "Read {} bytes from characteristic {}",
            data.len(),
            characteristic.uuid
        );
        Ok(data)
    }

    async fn write(&self, characteristic: &CharacteristicHandle, payload: &[u8]) -> Result<()> {
        let peripheral = self.peripheral(&characteristic.device_id)?;
        let target = Self::resolve_characteristic(&peripheral, characteristic)?;

        peripheral
            .write(&target, payload, WriteType::WithResponse)
            .await
            .map_err(Error::Bluetooth)?;
        trace!(
            "Wrote {} bytes to characteristic {}",
            payload.len(),
            characteristic.uuid
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        characteristic: &CharacteristicHandle,
        sink: NotificationSink,
    ) -> Result<()> {
        let peripheral = self.peripheral(&characteristic.device_id)?;
        let target = Self::resolve_characteristic(&peripheral, characteristic)?;

        peripheral.subscribe(&target).await.map_err(Error::Bluetooth)?;

        self.sinks.write().insert(
            (characteristic.device_id.clone(), characteristic.uuid),
            sink,
        );
        self.ensure_pump(&characteristic.device_id, &peripheral);

        debug!("Subscribed to notifications from {}", characteristic.uuid);
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: &CharacteristicHandle) -> Result<()> {
        self.sinks
            .write()
            .remove(&(characteristic.device_id.clone(), characteristic.uuid));

        let peripheral = self.peripheral(&characteristic.device_id)?;
        let target = Self::resolve_characteristic(&peripheral, characteristic)?;

        peripheral
            .unsubscribe(&target)
            .await
            .map_err(Error::Bluetooth)?;

        debug!("Unsubscribed from notifications from {}", characteristic.uuid);
        Ok(())
    }

    async fn disconnect(&self, server: &ServerHandle) -> Result<()> {
        if let Some(pump) = self.pumps.write().remove(&server.device_id) {
            pump.abort();
        }
        self.sinks
            .write()
            .retain(|(device_id, _), _| device_id != &server.device_id);

        let peripheral = self.peripheral(&server.device_id)?;
        peripheral.disconnect().await.map_err(Error::Bluetooth)?;

        info!("Disconnected from {}", server.device_id);
        Ok(())
    }

    fn disconnect_events(&self) -> broadcast::Receiver<String> {
        self.disconnect_tx.subscribe()
    }
}

impl Drop for BtlePlugTransport {
    fn drop(&mut self) {
        if let Some(task) = self.event_task.write().take() {
            task.abort();
        }
        for (_, pump) in self.pumps.write().drain() {
            pump.abort();
        }
    }
}
