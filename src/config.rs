//! Device family configuration.
//!
//! Everything that differs between device families — UUID sets, discovery
//! strategy, static characteristics, channel criticality, text layout,
//! the device-side disconnect command — lives here as data. Session logic
//! reads the configuration; it never branches on the family directly, so
//! a new hardware revision is a new configuration value, not new control
//! flow.

use uuid::Uuid;

use crate::ble::uuids::*;
use crate::transport::ScanFilter;

/// Supported device family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceFamily {
    /// PMScan particulate monitor (binary fixed-offset frames).
    PmScan,
    /// AirBeam particulate monitor (textual line-oriented frames).
    AirBeam,
}

impl std::fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PmScan => write!(f, "PMScan"),
            Self::AirBeam => write!(f, "AirBeam"),
        }
    }
}

/// How the primary service is located on a freshly connected device.
///
/// Candidates are tried in order; with `fallback_enumerate` set, a miss
/// falls back to enumerating every service and probing each for the
/// primary data characteristic. Firmware revisions have moved the service
/// UUID, so this is configuration rather than inline control flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryStrategy {
    /// Service UUIDs to try, in order of preference.
    pub candidates: Vec<Uuid>,
    /// Whether to enumerate all services when no candidate resolves.
    pub fallback_enumerate: bool,
}

/// Logical notification channel role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// The measurement stream. Losing this makes the session useless.
    PrimaryData,
    /// Stored-measurement replay or other auxiliary data.
    SecondaryData,
    /// Battery level pushes.
    Battery,
    /// Charging state pushes.
    Charging,
}

impl ChannelKind {
    /// Human-readable channel name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PrimaryData => "primary data",
            Self::SecondaryData => "secondary data",
            Self::Battery => "battery",
            Self::Charging => "charging",
        }
    }
}

/// One notification channel of a device family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    /// The channel's role.
    pub kind: ChannelKind,
    /// The characteristic carrying it.
    pub uuid: Uuid,
    /// Whether a failed subscription aborts initialization (critical) or
    /// merely degrades the session to partially connected.
    pub critical: bool,
}

/// Static characteristics read once during initialization.
///
/// Absent entries are skipped; not every family exposes every attribute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticCharacteristics {
    /// Battery level percent (single byte).
    pub battery: Option<Uuid>,
    /// Firmware version string.
    pub firmware: Option<Uuid>,
    /// Operating mode byte.
    pub mode: Option<Uuid>,
    /// Sampling interval, u16 little-endian seconds.
    pub interval: Option<Uuid>,
    /// Opaque display configuration blob.
    pub display: Option<Uuid>,
    /// Device clock, u32 little-endian seconds since the device epoch.
    pub clock: Option<Uuid>,
}

/// Device-side disconnect command, for families that define one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisconnectCommand {
    /// The characteristic the mode byte is written to.
    pub characteristic: Uuid,
    /// The bit set in the mode byte to request a disconnect.
    pub mode_bit: u8,
}

/// Which optional reading fields a family can produce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Whether readings may carry barometric pressure.
    pub pressure: bool,
    /// Whether readings may carry a TVOC index.
    pub tvoc: bool,
}

/// Field positions within a whitespace-tokenized textual frame.
///
/// The exact vector layout varies by firmware; these defaults match the
/// common revision and are configuration to confirm against hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextLayout {
    /// Minimum token count for the fixed-width format.
    pub min_fields: usize,
    /// Token index of the temperature field.
    pub temperature: usize,
    /// Token index of the humidity field.
    pub humidity: usize,
    /// Token index of the PM1.0 field.
    pub pm1: usize,
    /// Token index of the PM2.5 field.
    pub pm2_5: usize,
    /// Token index of the PM10 field.
    pub pm10: usize,
}

impl Default for TextLayout {
    fn default() -> Self {
        // <millis> <pack-id> <temp> <rh> <pm1> <pm2.5> <pm10>
        Self {
            min_fields: 7,
            temperature: 2,
            humidity: 3,
            pm1: 4,
            pm2_5: 5,
            pm10: 6,
        }
    }
}

/// Full wiring description of one device family.
#[derive(Debug, Clone, PartialEq)]
pub struct FamilyConfig {
    /// The family this configuration describes.
    pub family: DeviceFamily,
    /// Filter applied while scanning.
    pub scan_filter: ScanFilter,
    /// How the primary service is located.
    pub discovery: DiscoveryStrategy,
    /// Static characteristics read during initialization.
    pub static_chars: StaticCharacteristics,
    /// Notification channels to subscribe.
    pub channels: Vec<ChannelSpec>,
    /// Seconds from the Unix epoch to the device epoch, for clock sync.
    pub clock_epoch_offset: i64,
    /// Device-side disconnect command, if the family defines one.
    pub disconnect_command: Option<DisconnectCommand>,
    /// Optional reading fields this family can produce.
    pub capabilities: Capabilities,
    /// Textual frame layout, for line-oriented families.
    pub text_layout: Option<TextLayout>,
}

impl FamilyConfig {
    /// Configuration for the PMScan family.
    pub fn pmscan() -> Self {
        Self {
            family: DeviceFamily::PmScan,
            scan_filter: ScanFilter {
                name_prefix: Some("PMScan".to_string()),
                service: Some(PMSCAN_SERVICE_UUID),
            },
            discovery: DiscoveryStrategy {
                candidates: vec![PMSCAN_SERVICE_UUID, PMSCAN_LEGACY_SERVICE_UUID],
                fallback_enumerate: true,
            },
            static_chars: StaticCharacteristics {
                battery: Some(PMSCAN_BATTERY_UUID),
                firmware: Some(PMSCAN_FIRMWARE_UUID),
                mode: Some(PMSCAN_MODE_UUID),
                interval: Some(PMSCAN_INTERVAL_UUID),
                display: Some(PMSCAN_DISPLAY_UUID),
                clock: Some(PMSCAN_CLOCK_UUID),
            },
            channels: vec![
                ChannelSpec {
                    kind: ChannelKind::PrimaryData,
                    uuid: PMSCAN_REALTIME_DATA_UUID,
                    critical: true,
                },
                ChannelSpec {
                    kind: ChannelKind::SecondaryData,
                    uuid: PMSCAN_MEMORY_DATA_UUID,
                    critical: false,
                },
                ChannelSpec {
                    kind: ChannelKind::Battery,
                    uuid: PMSCAN_BATTERY_UUID,
                    critical: false,
                },
                ChannelSpec {
                    kind: ChannelKind::Charging,
                    uuid: PMSCAN_CHARGING_UUID,
                    critical: false,
                },
            ],
            clock_epoch_offset: PMSCAN_EPOCH_OFFSET,
            disconnect_command: Some(DisconnectCommand {
                characteristic: PMSCAN_MODE_UUID,
                mode_bit: PMSCAN_MODE_DISCONNECT_BIT,
            }),
            capabilities: Capabilities {
                pressure: true,
                tvoc: true,
            },
            text_layout: None,
        }
    }

    /// Configuration for the AirBeam family.
    pub fn airbeam() -> Self {
        Self {
            family: DeviceFamily::AirBeam,
            scan_filter: ScanFilter {
                name_prefix: Some("AirBeam".to_string()),
                service: Some(AIRBEAM_SERVICE_UUID),
            },
            discovery: DiscoveryStrategy {
                candidates: vec![AIRBEAM_SERVICE_UUID],
                fallback_enumerate: true,
            },
            static_chars: StaticCharacteristics::default(),
            channels: vec![ChannelSpec {
                kind: ChannelKind::PrimaryData,
                uuid: AIRBEAM_DATA_UUID,
                critical: true,
            }],
            clock_epoch_offset: 0,
            disconnect_command: None,
            capabilities: Capabilities::default(),
            text_layout: Some(TextLayout::default()),
        }
    }

    /// Look up a channel by role.
    pub fn channel(&self, kind: ChannelKind) -> Option<&ChannelSpec> {
        self.channels.iter().find(|c| c.kind == kind)
    }
}
