//! BLE Service and Characteristic UUIDs.
//!
//! Wire-format constants for the supported device families. These must
//! match the hardware verbatim; firmware revisions have shipped with
//! diverging UUID sets, so session logic never hardcodes them — it takes
//! the set to use from [`crate::config::FamilyConfig`].

use uuid::Uuid;

// PMScan service (custom 128-bit)
/// PMScan primary sensor service UUID.
pub const PMSCAN_SERVICE_UUID: Uuid = Uuid::from_u128(0xf364_1900_00b0_4240_ba50_05ca45bf8abc);
/// PMScan service UUID used by pre-1.4 firmware.
pub const PMSCAN_LEGACY_SERVICE_UUID: Uuid =
    Uuid::from_u128(0xf364_1800_00b0_4240_ba50_05ca45bf8abc);
/// Real-time measurement frames (Notify).
pub const PMSCAN_REALTIME_DATA_UUID: Uuid = Uuid::from_u128(0xf364_1901_00b0_4240_ba50_05ca45bf8abc);
/// Stored-measurement replay frames (Notify).
pub const PMSCAN_MEMORY_DATA_UUID: Uuid = Uuid::from_u128(0xf364_1902_00b0_4240_ba50_05ca45bf8abc);
/// Operating mode byte (Read, Write).
pub const PMSCAN_MODE_UUID: Uuid = Uuid::from_u128(0xf364_1903_00b0_4240_ba50_05ca45bf8abc);
/// Sampling interval in seconds, u16 little-endian (Read, Write).
pub const PMSCAN_INTERVAL_UUID: Uuid = Uuid::from_u128(0xf364_1904_00b0_4240_ba50_05ca45bf8abc);
/// Display configuration blob (Read, Write).
pub const PMSCAN_DISPLAY_UUID: Uuid = Uuid::from_u128(0xf364_1905_00b0_4240_ba50_05ca45bf8abc);
/// Battery level percent (Read, Notify).
pub const PMSCAN_BATTERY_UUID: Uuid = Uuid::from_u128(0xf364_1906_00b0_4240_ba50_05ca45bf8abc);
/// Charging flag (Read, Notify).
pub const PMSCAN_CHARGING_UUID: Uuid = Uuid::from_u128(0xf364_1907_00b0_4240_ba50_05ca45bf8abc);
/// Device clock, seconds since the device epoch, u32 little-endian
/// (Read, Write).
pub const PMSCAN_CLOCK_UUID: Uuid = Uuid::from_u128(0xf364_1908_00b0_4240_ba50_05ca45bf8abc);
/// Firmware version string (Read).
pub const PMSCAN_FIRMWARE_UUID: Uuid = Uuid::from_u128(0xf364_1909_00b0_4240_ba50_05ca45bf8abc);

/// Bit set in the mode byte to request a device-side disconnect.
pub const PMSCAN_MODE_DISCONNECT_BIT: u8 = 0x40;

/// Seconds from the Unix epoch to the PMScan device epoch (2000-01-01).
pub const PMSCAN_EPOCH_OFFSET: i64 = 946_684_800;

// AirBeam UART-style service (16-bit derived)
/// AirBeam serial service UUID.
pub const AIRBEAM_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_ffe0_0000_1000_8000_00805f9b34fb);
/// AirBeam serial data characteristic (Notify); carries the textual
/// line-oriented frames.
pub const AIRBEAM_DATA_UUID: Uuid = Uuid::from_u128(0x0000_ffe1_0000_1000_8000_00805f9b34fb);

/// Check if a service UUID belongs to a PMScan device.
pub fn is_pmscan_service(uuid: &Uuid) -> bool {
    *uuid == PMSCAN_SERVICE_UUID || *uuid == PMSCAN_LEGACY_SERVICE_UUID
}

/// Check if a service UUID belongs to an AirBeam device.
pub fn is_airbeam_service(uuid: &Uuid) -> bool {
    *uuid == AIRBEAM_SERVICE_UUID
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        let service = PMSCAN_SERVICE_UUID.to_string();
        assert!(service.contains("f3641900"));

        let airbeam = AIRBEAM_SERVICE_UUID.to_string();
        assert!(airbeam.contains("ffe0"));
    }

    #[test]
    fn test_is_pmscan_service() {
        assert!(is_pmscan_service(&PMSCAN_SERVICE_UUID));
        assert!(is_pmscan_service(&PMSCAN_LEGACY_SERVICE_UUID));
        assert!(!is_pmscan_service(&AIRBEAM_SERVICE_UUID));
    }

    #[test]
    fn test_is_airbeam_service() {
        assert!(is_airbeam_service(&AIRBEAM_SERVICE_UUID));
        assert!(!is_airbeam_service(&PMSCAN_SERVICE_UUID));
    }

    #[test]
    fn test_characteristics_live_in_service_range() {
        for uuid in [
            PMSCAN_REALTIME_DATA_UUID,
            PMSCAN_MEMORY_DATA_UUID,
            PMSCAN_MODE_UUID,
            PMSCAN_BATTERY_UUID,
            PMSCAN_CLOCK_UUID,
        ] {
            assert!(uuid.to_string().starts_with("f36419"));
        }
    }
}
