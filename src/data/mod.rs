//! Data structures for sensor data.
//!
//! This module contains the core data types used to represent decoded
//! sensor readings, per-session device attributes, and the persisted
//! preferred-device record.

pub mod device_state;
pub mod preferences;
pub mod reading;

pub use device_state::{DeviceState, OperatingMode};
pub use preferences::{MemoryPreferredDeviceStore, PreferredDevice, PreferredDeviceStore};
pub use reading::{ParticleCounts, SensorReading};
