//! First-time device initialization.
//!
//! After the link comes up, the initializer locates the primary service
//! via the family's discovery strategy, reads the static characteristics
//! into a fresh [`DeviceState`], performs the one-time clock sync, and
//! starts the notification subscriptions concurrently. Only the critical
//! channel can abort initialization; non-critical failures degrade the
//! session to partially connected.

use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::{ChannelSpec, FamilyConfig};
use crate::data::DeviceState;
use crate::error::{Error, Result};
use crate::transport::{
    with_retry, with_timeout, BleTransport, CharacteristicHandle, NotificationSink, ServerHandle,
    ServiceHandle, IO_ATTEMPTS, IO_TIMEOUT, SUBSCRIBE_TIMEOUT,
};

/// One notification channel wired to its bounded queue.
///
/// Created by the manager before initialization; the resolved
/// characteristic handle is filled in at subscribe time so it can be
/// re-subscribed later without rebuilding the queue.
pub(crate) struct ChannelBinding {
    /// The channel's role and characteristic UUID.
    pub spec: ChannelSpec,
    /// Sink feeding the channel's drain task.
    pub sink: NotificationSink,
    /// Characteristic handle resolved during the last subscription.
    pub characteristic: RwLock<Option<CharacteristicHandle>>,
}

/// Result of a successful initialization.
pub struct InitOutcome {
    /// Snapshot of the device attributes read during initialization.
    pub state: DeviceState,
    /// The resolved primary service.
    pub service: ServiceHandle,
    /// Whether one or more non-critical channels failed to subscribe.
    pub degraded: bool,
}

/// Orchestrates discovery, static reads, clock sync and subscriptions
/// for a freshly connected device.
pub struct DeviceInitializer<'a, T: BleTransport> {
    transport: &'a T,
    config: &'a FamilyConfig,
}

impl<'a, T: BleTransport> DeviceInitializer<'a, T> {
    /// Create an initializer over a transport and family configuration.
    pub fn new(transport: &'a T, config: &'a FamilyConfig) -> Self {
        Self { transport, config }
    }

    /// Run the full initialization sequence.
    pub(crate) async fn initialize(
        &self,
        server: &ServerHandle,
        bindings: &[Arc<ChannelBinding>],
    ) -> Result<InitOutcome> {
        let service = self.resolve_primary_service(server).await?;
        debug!("primary service resolved: {}", service.uuid);

        let mut state = DeviceState::new();
        self.read_static_characteristics(&service, &mut state).await;
        self.sync_clock(&service).await;

        let degraded = subscribe_channels(self.transport, &service, bindings).await?;

        info!(
            "device initialized ({}{})",
            self.config.family,
            if degraded { ", degraded" } else { "" }
        );

        Ok(InitOutcome {
            state,
            service,
            degraded,
        })
    }

    /// Locate the primary service using the discovery strategy.
    ///
    /// Candidates are tried in order; if none resolves and the strategy
    /// allows it, every service is enumerated and probed for the primary
    /// data characteristic.
    pub(crate) async fn resolve_primary_service(
        &self,
        server: &ServerHandle,
    ) -> Result<ServiceHandle> {
        for candidate in &self.config.discovery.candidates {
            match self.transport.service(server, *candidate).await {
                Ok(service) => return Ok(service),
                Err(e) => debug!("service candidate {} not present: {}", candidate, e),
            }
        }

        if self.config.discovery.fallback_enumerate {
            let primary_uuid = self
                .config
                .channels
                .iter()
                .find(|c| c.critical)
                .map(|c| c.uuid);

            if let Some(primary_uuid) = primary_uuid {
                debug!("no candidate service resolved, enumerating all services");
                for service in self.transport.services(server).await? {
                    if self
                        .transport
                        .characteristic(&service, primary_uuid)
                        .await
                        .is_ok()
                    {
                        warn!(
                            "primary service found by enumeration: {} (not in candidate list)",
                            service.uuid
                        );
                        return Ok(service);
                    }
                }
            }
        }

        Err(Error::ServiceNotFound {
            uuid: self
                .config
                .discovery
                .candidates
                .first()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "none configured".to_string()),
        })
    }

    /// Read the static characteristics sequentially.
    ///
    /// Individual read failures leave the protocol defaults in place;
    /// only service discovery is fatal during initialization.
    async fn read_static_characteristics(&self, service: &ServiceHandle, state: &mut DeviceState) {
        let chars = &self.config.static_chars;

        if let Some(uuid) = chars.battery {
            match self.read_value(service, uuid, "battery").await {
                Ok(value) if !value.is_empty() => state.battery = value[0].min(100),
                Ok(_) => warn!("empty battery value"),
                Err(e) => warn!("battery read failed, keeping default: {}", e),
            }
        }

        if let Some(uuid) = chars.firmware {
            match self.read_value(service, uuid, "firmware version").await {
                Ok(value) => {
                    state.firmware_version =
                        String::from_utf8_lossy(&value).trim_end_matches('\0').to_string();
                }
                Err(e) => warn!("firmware version read failed: {}", e),
            }
        }

        if let Some(uuid) = chars.mode {
            match self.read_value(service, uuid, "mode").await {
                Ok(value) if !value.is_empty() => state.set_mode_raw(value[0]),
                Ok(_) => warn!("empty mode value"),
                Err(e) => warn!("mode read failed: {}", e),
            }
        }

        if let Some(uuid) = chars.interval {
            match self.read_value(service, uuid, "sampling interval").await {
                Ok(value) if value.len() >= 2 => {
                    state.sampling_interval_secs = u16::from_le_bytes([value[0], value[1]]);
                }
                Ok(value) => warn!("sampling interval too short: {} bytes", value.len()),
                Err(e) => warn!("sampling interval read failed: {}", e),
            }
        }

        if let Some(uuid) = chars.display {
            match self.read_value(service, uuid, "display config").await {
                Ok(value) => state.display_config = value,
                Err(e) => warn!("display config read failed: {}", e),
            }
        }
    }

    /// One-time clock synchronization.
    ///
    /// The device stores seconds since its own epoch. A value of zero
    /// means the clock was never set, so the current time is written; a
    /// running clock is left untouched.
    async fn sync_clock(&self, service: &ServiceHandle) {
        let Some(uuid) = self.config.static_chars.clock else {
            return;
        };

        let stored = match self.read_value(service, uuid, "device clock").await {
            Ok(value) if value.len() >= 4 => {
                u32::from_le_bytes([value[0], value[1], value[2], value[3]])
            }
            Ok(value) => {
                warn!("device clock value too short: {} bytes", value.len());
                return;
            }
            Err(e) => {
                warn!("device clock read failed, skipping sync: {}", e);
                return;
            }
        };

        if stored != 0 {
            debug!("device clock already set ({} device-epoch seconds)", stored);
            return;
        }

        let device_now = (Utc::now().timestamp() - self.config.clock_epoch_offset).max(0) as u32;
        let payload = device_now.to_le_bytes();
        let result = async {
            let characteristic = self.transport.characteristic(service, uuid).await?;
            with_retry("clock write", IO_ATTEMPTS, || {
                with_timeout(
                    IO_TIMEOUT,
                    "clock write",
                    self.transport.write(&characteristic, &payload),
                )
            })
            .await
        }
        .await;

        match result {
            Ok(()) => info!("synchronized device clock to {} device-epoch seconds", device_now),
            Err(e) => warn!("device clock write failed: {}", e),
        }
    }

    async fn read_value(
        &self,
        service: &ServiceHandle,
        uuid: uuid::Uuid,
        label: &str,
    ) -> Result<Vec<u8>> {
        let characteristic = self.transport.characteristic(service, uuid).await?;
        with_retry(label, IO_ATTEMPTS, || {
            with_timeout(IO_TIMEOUT, label, self.transport.read(&characteristic))
        })
        .await
    }
}

/// Subscribe every channel binding, concurrently.
///
/// Outcomes are collected independently: a critical-channel failure
/// aborts with an error, non-critical failures are logged and reported
/// through the returned degraded flag.
pub(crate) async fn subscribe_channels<T: BleTransport>(
    transport: &T,
    service: &ServiceHandle,
    bindings: &[Arc<ChannelBinding>],
) -> Result<bool> {
    let attempts = bindings.iter().map(|binding| async move {
        let result = async {
            let characteristic = transport.characteristic(service, binding.spec.uuid).await?;
            with_retry(binding.spec.kind.name(), IO_ATTEMPTS, || {
                with_timeout(
                    SUBSCRIBE_TIMEOUT,
                    binding.spec.kind.name(),
                    transport.subscribe(&characteristic, binding.sink.clone()),
                )
            })
            .await?;
            *binding.characteristic.write() = Some(characteristic);
            Ok::<(), Error>(())
        }
        .await;
        (binding, result)
    });

    let outcomes = futures::future::join_all(attempts).await;

    let mut degraded = false;
    for (binding, result) in outcomes {
        match result {
            Ok(()) => debug!("subscribed {} channel", binding.spec.kind.name()),
            Err(e) if binding.spec.critical => {
                error!(
                    "critical {} channel failed to subscribe: {}",
                    binding.spec.kind.name(),
                    e
                );
                return Err(Error::SubscriptionFailed {
                    channel: binding.spec.kind.name().to_string(),
                    reason: e.to_string(),
                });
            }
            Err(e) => {
                warn!(
                    "non-critical {} channel unavailable: {}",
                    binding.spec.kind.name(),
                    e
                );
                degraded = true;
            }
        }
    }

    Ok(degraded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::*;
    use crate::data::OperatingMode;
    use crate::transport::testing::FakeTransport;
    use crate::transport::NOTIFICATION_QUEUE_DEPTH;

    fn bindings_for(config: &FamilyConfig) -> Vec<Arc<ChannelBinding>> {
        config
            .channels
            .iter()
            .map(|spec| {
                let (sink, _rx) = NotificationSink::channel(NOTIFICATION_QUEUE_DEPTH);
                Arc::new(ChannelBinding {
                    spec: spec.clone(),
                    sink,
                    characteristic: RwLock::new(None),
                })
            })
            .collect()
    }

    fn pmscan_fake() -> FakeTransport {
        let fake = FakeTransport::new();
        fake.services.lock().push(PMSCAN_SERVICE_UUID);
        fake.read_values.lock().insert(PMSCAN_BATTERY_UUID, vec![87]);
        fake.read_values
            .lock()
            .insert(PMSCAN_FIRMWARE_UUID, b"2.3.1".to_vec());
        fake.read_values.lock().insert(PMSCAN_MODE_UUID, vec![0x01]);
        fake.read_values
            .lock()
            .insert(PMSCAN_INTERVAL_UUID, 10u16.to_le_bytes().to_vec());
        fake.read_values
            .lock()
            .insert(PMSCAN_DISPLAY_UUID, vec![0xAA, 0xBB]);
        fake.read_values
            .lock()
            .insert(PMSCAN_CLOCK_UUID, 0u32.to_le_bytes().to_vec());
        fake
    }

    fn server() -> ServerHandle {
        ServerHandle {
            device_id: "dev-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_full_initialization() {
        let fake = pmscan_fake();
        let config = FamilyConfig::pmscan();
        let bindings = bindings_for(&config);

        let initializer = DeviceInitializer::new(&fake, &config);
        let outcome = initializer
            .initialize(&server(), &bindings)
            .await
            .expect("initialization succeeds");

        assert!(!outcome.degraded);
        assert_eq!(outcome.service.uuid, PMSCAN_SERVICE_UUID);
        assert_eq!(outcome.state.battery, 87);
        assert_eq!(outcome.state.firmware_version, "2.3.1");
        assert_eq!(outcome.state.operating_mode, OperatingMode::Continuous);
        assert_eq!(outcome.state.sampling_interval_secs, 10);
        assert_eq!(outcome.state.display_config, vec![0xAA, 0xBB]);

        // Every channel ended up subscribed and kept its resolved handle.
        for binding in &bindings {
            assert!(fake.is_subscribed(binding.spec.uuid));
            assert!(binding.characteristic.read().is_some());
        }
    }

    #[tokio::test]
    async fn test_clock_written_only_when_zero() {
        let fake = pmscan_fake();
        let config = FamilyConfig::pmscan();
        let bindings = bindings_for(&config);

        DeviceInitializer::new(&fake, &config)
            .initialize(&server(), &bindings)
            .await
            .expect("initialization succeeds");

        let clock_writes: Vec<_> = fake
            .writes
            .lock()
            .iter()
            .filter(|(uuid, _)| *uuid == PMSCAN_CLOCK_UUID)
            .cloned()
            .collect();
        assert_eq!(clock_writes.len(), 1, "zero clock must be synchronized");
        assert_eq!(clock_writes[0].1.len(), 4);

        // A running clock is left untouched.
        let fake = pmscan_fake();
        fake.read_values
            .lock()
            .insert(PMSCAN_CLOCK_UUID, 777_000u32.to_le_bytes().to_vec());
        let bindings = bindings_for(&config);
        DeviceInitializer::new(&fake, &config)
            .initialize(&server(), &bindings)
            .await
            .expect("initialization succeeds");
        assert!(fake
            .writes
            .lock()
            .iter()
            .all(|(uuid, _)| *uuid != PMSCAN_CLOCK_UUID));
    }

    #[tokio::test]
    async fn test_critical_subscription_failure_is_fatal() {
        let fake = pmscan_fake();
        fake.failing_subscriptions
            .lock()
            .insert(PMSCAN_REALTIME_DATA_UUID);
        let config = FamilyConfig::pmscan();
        let bindings = bindings_for(&config);

        let result = DeviceInitializer::new(&fake, &config)
            .initialize(&server(), &bindings)
            .await;

        match result {
            Err(Error::SubscriptionFailed { channel, .. }) => {
                assert_eq!(channel, "primary data");
            }
            other => panic!("expected subscription failure, got ok={}", other.is_ok()),
        }
    }

    #[tokio::test]
    async fn test_non_critical_subscription_failure_degrades() {
        let fake = pmscan_fake();
        fake.failing_subscriptions.lock().insert(PMSCAN_BATTERY_UUID);
        let config = FamilyConfig::pmscan();
        let bindings = bindings_for(&config);

        let outcome = DeviceInitializer::new(&fake, &config)
            .initialize(&server(), &bindings)
            .await
            .expect("initialization still succeeds");

        assert!(outcome.degraded);
        assert!(fake.is_subscribed(PMSCAN_REALTIME_DATA_UUID));
        assert!(!fake.is_subscribed(PMSCAN_BATTERY_UUID));
    }

    #[tokio::test]
    async fn test_static_read_failure_keeps_defaults() {
        let fake = pmscan_fake();
        fake.missing_characteristics.lock().insert(PMSCAN_BATTERY_UUID);
        // Battery is both a static read and a non-critical channel, so
        // the missing characteristic also degrades the session.
        let config = FamilyConfig::pmscan();
        let bindings = bindings_for(&config);

        let outcome = DeviceInitializer::new(&fake, &config)
            .initialize(&server(), &bindings)
            .await
            .expect("initialization succeeds");

        assert_eq!(outcome.state.battery, 100, "protocol default battery");
        assert!(outcome.degraded);
    }

    #[tokio::test]
    async fn test_discovery_falls_back_to_legacy_candidate() {
        let fake = pmscan_fake();
        fake.services.lock().clear();
        fake.services.lock().push(PMSCAN_LEGACY_SERVICE_UUID);
        let config = FamilyConfig::pmscan();

        let service = DeviceInitializer::new(&fake, &config)
            .resolve_primary_service(&server())
            .await
            .expect("legacy candidate resolves");
        assert_eq!(service.uuid, PMSCAN_LEGACY_SERVICE_UUID);
    }

    #[tokio::test]
    async fn test_discovery_enumeration_fallback() {
        let fake = pmscan_fake();
        let moved_service = uuid::Uuid::from_u128(0xdead_beef);
        fake.services.lock().clear();
        fake.services.lock().push(moved_service);
        let config = FamilyConfig::pmscan();

        // The unknown service still carries the primary data
        // characteristic, so enumeration finds it.
        let service = DeviceInitializer::new(&fake, &config)
            .resolve_primary_service(&server())
            .await
            .expect("enumeration finds the service");
        assert_eq!(service.uuid, moved_service);
    }

    #[tokio::test]
    async fn test_discovery_failure_is_fatal() {
        let fake = FakeTransport::new();
        let config = FamilyConfig::pmscan();
        let bindings = bindings_for(&config);

        let result = DeviceInitializer::new(&fake, &config)
            .initialize(&server(), &bindings)
            .await;
        assert!(matches!(result, Err(Error::ServiceNotFound { .. })));
        assert!(bindings.iter().all(|b| b.characteristic.read().is_none()));
    }

    #[tokio::test]
    async fn test_airbeam_initialization_skips_static_reads() {
        let fake = FakeTransport::new();
        fake.services.lock().push(AIRBEAM_SERVICE_UUID);
        let config = FamilyConfig::airbeam();
        let bindings = bindings_for(&config);

        let outcome = DeviceInitializer::new(&fake, &config)
            .initialize(&server(), &bindings)
            .await
            .expect("initialization succeeds");

        assert!(!outcome.degraded);
        assert!(fake.writes.lock().is_empty(), "no static writes for AirBeam");
        assert!(fake.is_subscribed(AIRBEAM_DATA_UUID));
    }
}
