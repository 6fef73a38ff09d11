//! Preferred-device record and storage trait.
//!
//! After a device has been validated (connected and initialized), a small
//! record is written so the next scan can skip the picker when the same
//! device is in range. The core only defines the record and the storage
//! seam; durable backends belong to the embedding application.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// A remembered device from a previous successful session.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PreferredDevice {
    /// Platform identifier of the device.
    pub device_id: String,
    /// Human-readable name to show in pickers and logs.
    pub display_name: String,
    /// When the device last completed initialization.
    pub last_connected_at: DateTime<Utc>,
}

/// Storage seam for the preferred-device record.
pub trait PreferredDeviceStore: Send + Sync {
    /// Load the stored record, if any.
    fn load(&self) -> Option<PreferredDevice>;

    /// Replace the stored record.
    fn save(&self, record: &PreferredDevice);

    /// Forget the stored record.
    fn clear(&self);
}

/// In-memory store, the default when the application provides none.
#[derive(Debug, Default)]
pub struct MemoryPreferredDeviceStore {
    record: RwLock<Option<PreferredDevice>>,
}

impl MemoryPreferredDeviceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferredDeviceStore for MemoryPreferredDeviceStore {
    fn load(&self) -> Option<PreferredDevice> {
        self.record.read().clone()
    }

    fn save(&self, record: &PreferredDevice) {
        *self.record.write() = Some(record.clone());
    }

    fn clear(&self) {
        *self.record.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> PreferredDevice {
        PreferredDevice {
            device_id: id.to_string(),
            display_name: "PMScan 1234".to_string(),
            last_connected_at: Utc::now(),
        }
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryPreferredDeviceStore::new();
        assert!(store.load().is_none());

        store.save(&record("aa:bb:cc"));
        assert_eq!(store.load().map(|r| r.device_id), Some("aa:bb:cc".into()));

        store.save(&record("dd:ee:ff"));
        assert_eq!(store.load().map(|r| r.device_id), Some("dd:ee:ff".into()));

        store.clear();
        assert!(store.load().is_none());
    }
}
