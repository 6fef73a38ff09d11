// Allow holding locks across await points - we use parking_lot and keep
// guards scoped to single statements around suspension points
#![allow(clippy::await_holding_lock)]
// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # airsense-ble
//!
//! A cross-platform Rust library for portable air-quality sensors over
//! Bluetooth Low Energy. Two device families are supported: **PMScan**
//! particulate monitors (binary fixed-offset frames) and **AirBeam**
//! monitors (textual line-oriented frames).
//!
//! ## Features
//!
//! - **Explicit session state machine**: fixed transition table,
//!   per-state timeouts, bounded diagnostics history, error-threshold
//!   hard reset
//! - **Resilient reconnection**: a shared timer re-acquires lost links
//!   while a recording is active; sessions can never be torn down out
//!   from under an active recording without force
//! - **Robust decoding**: corrupt frames are dropped, implausible-but-
//!   finite values are kept with a warning, split textual frames are
//!   reassembled across packet boundaries
//! - **Capability-based transport**: all radio traffic goes through the
//!   [`BleTransport`] trait with explicit timeouts and retries; a
//!   btleplug-backed implementation is included
//! - **Device picker protocol**: ambiguous scans ask the embedding UI,
//!   with best-signal fallback and a persisted preferred-device record
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use airsense_ble::{BtlePlugTransport, DeviceAdapter, RecordingRegistry, SensorAdapter};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> airsense_ble::Result<()> {
//!     let transport = Arc::new(BtlePlugTransport::new().await?);
//!     let recording = RecordingRegistry::new();
//!     let adapter = DeviceAdapter::pmscan(transport, recording.clone());
//!
//!     adapter.request_device().await?;
//!     adapter.connect().await?;
//!     adapter.initialize_notifications().await?;
//!
//!     let _handle = adapter.on_reading(|reading| {
//!         println!("PM2.5: {:.1} µg/m³", reading.pm2_5);
//!     });
//!
//!     recording.set_foreground(true);
//!     tokio::time::sleep(std::time::Duration::from_secs(30)).await;
//!     recording.set_foreground(false);
//!
//!     adapter.disconnect(false).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod adapter;
pub mod ble;
pub mod config;
pub mod data;
pub mod error;
pub mod protocol;
pub mod recording;
pub mod transport;
pub mod utils;

// Re-exports for convenience
pub use adapter::{CallbackHandle, DeviceAdapter, SensorAdapter};
pub use error::{Error, Result};
pub use recording::{Reconnectable, RecordingRegistry};

// Re-export commonly used types from submodules
pub use ble::{
    ConnectionManager, ConnectionState, ConnectionStateMachine, DevicePicker, ManagerOptions,
    NotificationHandlers, PickerRequest, StateEvent, StateTimeouts,
};
pub use config::{
    Capabilities, ChannelKind, ChannelSpec, DeviceFamily, DiscoveryStrategy, FamilyConfig,
    TextLayout,
};
pub use data::{
    DeviceState, MemoryPreferredDeviceStore, OperatingMode, ParticleCounts, PreferredDevice,
    PreferredDeviceStore, SensorReading,
};
pub use protocol::{AirBeamDecoder, FrameDecoder, PmScanDecoder};
pub use transport::btle::BtlePlugTransport;
pub use transport::{
    BleTransport, CharacteristicHandle, DeviceHandle, NotificationSink, ScanFilter, ServerHandle,
    ServiceHandle,
};
