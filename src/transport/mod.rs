//! Capability-based BLE transport.
//!
//! The session core never talks to a platform BLE stack directly: every
//! radio operation goes through the [`BleTransport`] trait, so the same
//! connection logic runs against btleplug on desktop, a native bridge on
//! mobile, or a scripted fake in tests. Handles are plain data; the
//! transport implementation maps them back to platform objects.
//!
//! This module also owns the timeout and retry discipline: each transport
//! call is raced against a per-operation budget so a hung platform call
//! rejects instead of blocking the session forever, and transient
//! failures are re-attempted with backoff unless the error class is
//! terminal (see [`Error::is_retryable`]).

pub mod btle;

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Budget for establishing a link.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Budget for a single characteristic read or write.
pub const IO_TIMEOUT: Duration = Duration::from_secs(5);
/// Budget for starting a notification subscription.
pub const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(8);

/// Connection attempts before giving up.
pub const CONNECT_ATTEMPTS: u32 = 3;
/// Attempts for reads, writes and subscriptions.
pub const IO_ATTEMPTS: u32 = 2;

/// First retry delay; doubles on each subsequent attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// Depth of the per-characteristic notification queue.
pub const NOTIFICATION_QUEUE_DEPTH: usize = 64;

/// A device discovered during scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    /// Platform identifier (MAC address or platform UUID).
    pub id: String,
    /// Advertised name, if any.
    pub name: Option<String>,
    /// Signal strength in dBm at discovery time, if known.
    pub rssi: Option<i16>,
}

/// An established GATT link to a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHandle {
    /// Identifier of the connected device.
    pub device_id: String,
}

/// A resolved GATT service on a connected device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    /// Identifier of the device exposing the service.
    pub device_id: String,
    /// Service UUID.
    pub uuid: Uuid,
}

/// A resolved GATT characteristic within a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicHandle {
    /// Identifier of the device exposing the characteristic.
    pub device_id: String,
    /// UUID of the containing service.
    pub service: Uuid,
    /// Characteristic UUID.
    pub uuid: Uuid,
}

/// Filter applied while scanning for devices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Only report devices whose advertised name starts with this prefix.
    pub name_prefix: Option<String>,
    /// Only report devices advertising this service.
    pub service: Option<Uuid>,
}

/// Bounded sink for notification payloads of one characteristic.
///
/// Notifications are queued and drained in arrival order by a single
/// task, which is what makes the in-order processing guarantee explicit
/// rather than an accident of platform event-loop behavior. When the
/// queue is full the newest payload is dropped with a warning; payloads
/// are never reordered or coalesced.
#[derive(Debug, Clone)]
pub struct NotificationSink {
    tx: mpsc::Sender<Vec<u8>>,
}

impl NotificationSink {
    /// Create a sink and the receiver its drain task reads from.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Deliver one notification payload. Never blocks the transport.
    pub fn deliver(&self, payload: Vec<u8>) {
        if let Err(e) = self.tx.try_send(payload) {
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    warn!("notification queue full, dropping payload");
                }
                mpsc::error::TrySendError::Closed(_) => {
                    debug!("notification queue closed, dropping payload");
                }
            }
        }
    }
}

/// Platform BLE primitives consumed by the session core.
///
/// Implementations are expected to resolve each call exactly once; the
/// caller supplies the timeout race and retry policy via [`with_timeout`]
/// and [`with_retry`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BleTransport: Send + Sync + 'static {
    /// Scan for devices matching the filter for the given window.
    async fn scan(&self, filter: &ScanFilter, window: Duration) -> Result<Vec<DeviceHandle>>;

    /// Establish a link to a discovered device.
    async fn connect(&self, device: &DeviceHandle) -> Result<ServerHandle>;

    /// Resolve a service by UUID on a connected device.
    async fn service(&self, server: &ServerHandle, uuid: Uuid) -> Result<ServiceHandle>;

    /// Enumerate all services on a connected device.
    async fn services(&self, server: &ServerHandle) -> Result<Vec<ServiceHandle>>;

    /// Resolve a characteristic by UUID within a service.
    async fn characteristic(
        &self,
        service: &ServiceHandle,
        uuid: Uuid,
    ) -> Result<CharacteristicHandle>;

    /// Read the current value of a characteristic.
    async fn read(&self, characteristic: &CharacteristicHandle) -> Result<Vec<u8>>;

    /// Write a value to a characteristic.
    async fn write(&self, characteristic: &CharacteristicHandle, payload: &[u8]) -> Result<()>;

    /// Subscribe to notifications, delivering payloads into the sink.
    async fn subscribe(
        &self,
        characteristic: &CharacteristicHandle,
        sink: NotificationSink,
    ) -> Result<()>;

    /// Remove a notification subscription.
    async fn unsubscribe(&self, characteristic: &CharacteristicHandle) -> Result<()>;

    /// Tear down the link to a device.
    async fn disconnect(&self, server: &ServerHandle) -> Result<()>;

    /// Stream of device identifiers whose link dropped unexpectedly.
    fn disconnect_events(&self) -> broadcast::Receiver<String>;
}

/// Race a transport operation against its budget.
///
/// A platform call that never resolves would otherwise hang the session;
/// the timeout floor turns it into a retryable [`Error::Timeout`].
pub async fn with_timeout<T>(
    budget: Duration,
    operation: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(budget, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!("{} did not resolve within {:?}", operation, budget);
            Err(Error::Timeout {
                operation: operation.to_string(),
            })
        }
    }
}

/// Run an operation up to `attempts` times with doubling backoff.
///
/// Non-retryable error classes (user cancelled, permission denied,
/// bluetooth unavailable, device not found) propagate immediately.
pub async fn with_retry<T, F, Fut>(operation: &str, attempts: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = RETRY_BASE_DELAY;
    let mut last_error = None;

    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => {
                debug!("{} failed with non-retryable error: {}", operation, e);
                return Err(e);
            }
            Err(e) => {
                warn!("{} attempt {}/{} failed: {}", operation, attempt, attempts, e);
                last_error = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| Error::Internal(format!("{operation}: no attempts were made"))))
}

/// Scripted in-memory transport for session tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// A fake transport backed by scripted tables.
    ///
    /// Tests populate the tables up front, then drive the session and
    /// inject notifications or link drops.
    pub(crate) struct FakeTransport {
        /// Devices returned by `scan`.
        pub devices: Mutex<Vec<DeviceHandle>>,
        /// Service UUIDs present on the device.
        pub services: Mutex<Vec<Uuid>>,
        /// Characteristics that resolve as absent.
        pub missing_characteristics: Mutex<HashSet<Uuid>>,
        /// Characteristics whose subscription always fails.
        pub failing_subscriptions: Mutex<HashSet<Uuid>>,
        /// Characteristics whose writes always fail.
        pub failing_writes: Mutex<HashSet<Uuid>>,
        /// Values returned by `read`, keyed by characteristic UUID.
        pub read_values: Mutex<HashMap<Uuid, Vec<u8>>>,
        /// Every write performed, in order.
        pub writes: Mutex<Vec<(Uuid, Vec<u8>)>>,
        /// Connect calls that should fail before one succeeds.
        pub connect_failures_remaining: AtomicU32,
        pub connect_calls: AtomicU32,
        pub disconnect_calls: AtomicU32,
        pub unsubscribe_calls: AtomicU32,
        pub subscribe_calls: AtomicU32,
        sinks: Mutex<HashMap<Uuid, NotificationSink>>,
        disconnect_tx: broadcast::Sender<String>,
    }

    impl FakeTransport {
        pub(crate) fn new() -> Self {
            let (disconnect_tx, _) = broadcast::channel(16);
            Self {
                devices: Mutex::new(Vec::new()),
                services: Mutex::new(Vec::new()),
                missing_characteristics: Mutex::new(HashSet::new()),
                failing_subscriptions: Mutex::new(HashSet::new()),
                failing_writes: Mutex::new(HashSet::new()),
                read_values: Mutex::new(HashMap::new()),
                writes: Mutex::new(Vec::new()),
                connect_failures_remaining: AtomicU32::new(0),
                connect_calls: AtomicU32::new(0),
                disconnect_calls: AtomicU32::new(0),
                unsubscribe_calls: AtomicU32::new(0),
                subscribe_calls: AtomicU32::new(0),
                sinks: Mutex::new(HashMap::new()),
                disconnect_tx,
            }
        }

        pub(crate) fn add_device(&self, id: &str, name: &str, rssi: i16) {
            self.devices.lock().push(DeviceHandle {
                id: id.to_string(),
                name: Some(name.to_string()),
                rssi: Some(rssi),
            });
        }

        /// Push a notification payload into a subscribed characteristic.
        pub(crate) fn emit(&self, characteristic: Uuid, payload: Vec<u8>) {
            if let Some(sink) = self.sinks.lock().get(&characteristic) {
                sink.deliver(payload);
            }
        }

        pub(crate) fn is_subscribed(&self, characteristic: Uuid) -> bool {
            self.sinks.lock().contains_key(&characteristic)
        }

        /// Simulate an unexpected link drop.
        pub(crate) fn drop_link(&self, device_id: &str) {
            let _ = self.disconnect_tx.send(device_id.to_string());
        }
    }

    #[async_trait]
    impl BleTransport for FakeTransport {
        async fn scan(&self, _filter: &ScanFilter, _window: Duration) -> Result<Vec<DeviceHandle>> {
            Ok(self.devices.lock().clone())
        }

        async fn connect(&self, device: &DeviceHandle) -> Result<ServerHandle> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.connect_failures_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.connect_failures_remaining
                    .store(remaining - 1, Ordering::SeqCst);
                return Err(Error::ConnectionFailed {
                    reason: "scripted failure".to_string(),
                });
            }
            Ok(ServerHandle {
                device_id: device.id.clone(),
            })
        }

        async fn service(&self, server: &ServerHandle, uuid: Uuid) -> Result<ServiceHandle> {
            if self.services.lock().contains(&uuid) {
                Ok(ServiceHandle {
                    device_id: server.device_id.clone(),
                    uuid,
                })
            } else {
                Err(Error::ServiceNotFound {
                    uuid: uuid.to_string(),
                })
            }
        }

        async fn services(&self, server: &ServerHandle) -> Result<Vec<ServiceHandle>> {
            Ok(self
                .services
                .lock()
                .iter()
                .map(|uuid| ServiceHandle {
                    device_id: server.device_id.clone(),
                    uuid: *uuid,
                })
                .collect())
        }

        async fn characteristic(
            &self,
            service: &ServiceHandle,
            uuid: Uuid,
        ) -> Result<CharacteristicHandle> {
            if self.missing_characteristics.lock().contains(&uuid) {
                return Err(Error::CharacteristicNotFound {
                    uuid: uuid.to_string(),
                });
            }
            Ok(CharacteristicHandle {
                device_id: service.device_id.clone(),
                service: service.uuid,
                uuid,
            })
        }

        async fn read(&self, characteristic: &CharacteristicHandle) -> Result<Vec<u8>> {
            Ok(self
                .read_values
                .lock()
                .get(&characteristic.uuid)
                .cloned()
                .unwrap_or_default())
        }

        async fn write(&self, characteristic: &CharacteristicHandle, payload: &[u8]) -> Result<()> {
            if self.failing_writes.lock().contains(&characteristic.uuid) {
                self.writes
                    .lock()
                    .push((characteristic.uuid, payload.to_vec()));
                return Err(Error::ConnectionFailed {
                    reason: "scripted write failure".to_string(),
                });
            }
            self.writes
                .lock()
                .push((characteristic.uuid, payload.to_vec()));
            Ok(())
        }

        async fn subscribe(
            &self,
            characteristic: &CharacteristicHandle,
            sink: NotificationSink,
        ) -> Result<()> {
            self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
            if self.failing_subscriptions.lock().contains(&characteristic.uuid) {
                return Err(Error::SubscriptionFailed {
                    channel: characteristic.uuid.to_string(),
                    reason: "scripted subscription failure".to_string(),
                });
            }
            self.sinks.lock().insert(characteristic.uuid, sink);
            Ok(())
        }

        async fn unsubscribe(&self, characteristic: &CharacteristicHandle) -> Result<()> {
            self.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
            self.sinks.lock().remove(&characteristic.uuid);
            Ok(())
        }

        async fn disconnect(&self, _server: &ServerHandle) -> Result<()> {
            self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn disconnect_events(&self) -> broadcast::Receiver<String> {
            self.disconnect_tx.subscribe()
        }
    }

    /// Poll a predicate until it holds or the deadline passes.
    pub(crate) async fn wait_until<F: Fn() -> bool>(deadline: Duration, predicate: F) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < deadline {
            if predicate() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        predicate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_with_timeout_passes_through_success() {
        let result = with_timeout(Duration::from_millis(100), "read", async { Ok(7u8) }).await;
        assert_eq!(result.ok(), Some(7));
    }

    #[tokio::test]
    async fn test_with_timeout_rejects_hung_operation() {
        let result: Result<()> = with_timeout(Duration::from_millis(30), "connect", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        match result {
            Err(Error::Timeout { operation }) => assert_eq!(operation, "connect"),
            other => panic!("expected timeout, got {:?}", other.is_ok()),
        }
    }

    #[tokio::test]
    async fn test_with_retry_recovers_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = with_retry("connect", 3, move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(Error::ConnectionFailed {
                        reason: "transient".into(),
                    })
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;

        assert_eq!(result.ok(), Some(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_stops_on_non_retryable() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<()> = with_retry("connect", 3, move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::PermissionDenied)
            }
        })
        .await;

        assert!(matches!(result, Err(Error::PermissionDenied)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_returns_last_error_when_exhausted() {
        let result: Result<()> = with_retry("write", 2, || async {
            Err(Error::Timeout {
                operation: "write".into(),
            })
        })
        .await;

        assert!(matches!(result, Err(Error::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_notification_sink_drops_when_full() {
        let (sink, mut rx) = NotificationSink::channel(2);
        sink.deliver(vec![1]);
        sink.deliver(vec![2]);
        // Queue is full; this one is dropped, not reordered.
        sink.deliver(vec![3]);

        assert_eq!(rx.recv().await, Some(vec![1]));
        assert_eq!(rx.recv().await, Some(vec![2]));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_mock_transport_read_expectation() {
        let mut mock = MockBleTransport::new();
        mock.expect_read().returning(|_| Ok(vec![0x55]));

        let characteristic = CharacteristicHandle {
            device_id: "dev".into(),
            service: Uuid::from_u128(1),
            uuid: Uuid::from_u128(2),
        };
        let value = mock.read(&characteristic).await.ok();
        assert_eq!(value, Some(vec![0x55]));
    }
}
