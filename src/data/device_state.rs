//! Per-session device attributes.
//!
//! [`DeviceState`] holds the last-known static attributes of one sensor
//! session. It is populated by the initializer's static-characteristic
//! reads and mutated only by decoder/initializer callbacks on the owning
//! connection manager; it is reset when the session is torn down.

/// Operating mode reported by the device's mode characteristic.
///
/// The low two bits of the mode byte select the mode; higher bits carry
/// command flags (e.g. the disconnect-request bit) and are preserved in
/// [`DeviceState::mode_raw`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum OperatingMode {
    /// Idle, not sampling.
    #[default]
    Standby = 0,
    /// Continuous sampling at the configured interval.
    Continuous = 1,
    /// Sampling only when triggered.
    Triggered = 2,
    /// Low-power transit mode.
    Transit = 3,
}

impl OperatingMode {
    /// Create from the raw mode byte.
    pub fn from_raw(value: u8) -> Self {
        match value & 0x03 {
            1 => Self::Continuous,
            2 => Self::Triggered,
            3 => Self::Transit,
            _ => Self::Standby,
        }
    }

    /// Convert to the raw mode-selector value.
    pub fn to_raw(&self) -> u8 {
        *self as u8
    }

    /// Get a human-readable name for this mode.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Standby => "Standby",
            Self::Continuous => "Continuous",
            Self::Triggered => "Triggered",
            Self::Transit => "Transit",
        }
    }
}

impl std::fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Battery level assumed until the device reports one.
const DEFAULT_BATTERY: u8 = 100;

/// Last-known device attributes for one sensor session.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceState {
    /// Battery level, 0-100. Device-reported, or the protocol default
    /// until the first battery read/notification arrives.
    pub battery: u8,
    /// Whether the device reports that it is charging.
    pub charging: bool,
    /// Firmware version string, empty until read.
    pub firmware_version: String,
    /// Decoded operating mode.
    pub operating_mode: OperatingMode,
    /// The raw mode byte as last read, flag bits included.
    pub mode_raw: u8,
    /// Sampling interval in seconds.
    pub sampling_interval_secs: u16,
    /// Opaque display-configuration blob, as read from the device.
    pub display_config: Vec<u8>,
    /// Protocol-assigned session identifier. Empty before the first data
    /// frame carries one.
    pub session_id: String,
}

impl DeviceState {
    /// Create a fresh state with protocol defaults.
    pub fn new() -> Self {
        Self {
            battery: DEFAULT_BATTERY,
            charging: false,
            firmware_version: String::new(),
            operating_mode: OperatingMode::default(),
            mode_raw: 0,
            sampling_interval_secs: 0,
            display_config: Vec::new(),
            session_id: String::new(),
        }
    }

    /// Reset to protocol defaults. Called when the session is torn down.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Record the raw mode byte, updating the decoded mode as well.
    pub fn set_mode_raw(&mut self, value: u8) {
        self.mode_raw = value;
        self.operating_mode = OperatingMode::from_raw(value);
    }
}

impl Default for DeviceState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operating_mode_from_raw() {
        assert_eq!(OperatingMode::from_raw(0), OperatingMode::Standby);
        assert_eq!(OperatingMode::from_raw(1), OperatingMode::Continuous);
        assert_eq!(OperatingMode::from_raw(2), OperatingMode::Triggered);
        assert_eq!(OperatingMode::from_raw(3), OperatingMode::Transit);
        // Flag bits above the selector are ignored by the decode.
        assert_eq!(OperatingMode::from_raw(0x41), OperatingMode::Continuous);
    }

    #[test]
    fn test_new_defaults() {
        let state = DeviceState::new();
        assert_eq!(state.battery, DEFAULT_BATTERY);
        assert!(!state.charging);
        assert!(state.firmware_version.is_empty());
        assert!(state.session_id.is_empty());
        assert_eq!(state.operating_mode, OperatingMode::Standby);
    }

    #[test]
    fn test_set_mode_raw_preserves_flags() {
        let mut state = DeviceState::new();
        state.set_mode_raw(0x42);
        assert_eq!(state.mode_raw, 0x42);
        assert_eq!(state.operating_mode, OperatingMode::Triggered);
    }

    #[test]
    fn test_reset() {
        let mut state = DeviceState::new();
        state.battery = 12;
        state.charging = true;
        state.session_id = "A1B2C3D4".to_string();
        state.reset();
        assert_eq!(state, DeviceState::new());
    }
}
