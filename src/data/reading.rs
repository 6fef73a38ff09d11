//! Sensor reading value types.
//!
//! A [`SensorReading`] is the immutable result of decoding one data frame.
//! Timestamps are assigned by the receiving clock, not the device clock,
//! so readings from different sensors line up on a common timeline.

use chrono::{DateTime, Utc};

/// Particle counts per size bin, in particles per 0.1 litre of air.
///
/// Only present when the device appends the extended frame section;
/// most firmware revisions report mass concentrations only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ParticleCounts {
    /// Particles larger than 0.3 µm.
    pub um0_3: u32,
    /// Particles larger than 0.5 µm.
    pub um0_5: u32,
    /// Particles larger than 1.0 µm.
    pub um1_0: u32,
    /// Particles larger than 2.5 µm.
    pub um2_5: u32,
}

/// One decoded measurement frame from a sensor.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SensorReading {
    /// PM1.0 mass concentration in µg/m³. Some families omit this and
    /// report 0.
    pub pm1: f64,
    /// PM2.5 mass concentration in µg/m³.
    pub pm2_5: f64,
    /// PM10 mass concentration in µg/m³.
    pub pm10: f64,
    /// Temperature in °C.
    pub temperature: f64,
    /// Relative humidity in %RH.
    pub humidity: f64,
    /// Barometric pressure in hPa, when the device reports it.
    pub pressure: Option<f64>,
    /// Volatile-organic-compound index, when the device reports it.
    pub tvoc_index: Option<f64>,
    /// Particle-size-bin counts, when the frame carries them.
    pub particle_counts: Option<ParticleCounts>,
    /// Battery level (0-100) at the time of the reading.
    pub battery: u8,
    /// Whether the device was charging at the time of the reading.
    pub charging: bool,
    /// Receiving-clock timestamp assigned when the frame was decoded.
    pub timestamp: DateTime<Utc>,
    /// Optional application-assigned location label.
    pub location_label: Option<String>,
}

impl SensorReading {
    /// Create a reading from the core measurement fields.
    ///
    /// The timestamp is taken from the receiving clock; battery and
    /// charging default to unknown-session values and are stamped by the
    /// session owner before the reading is emitted.
    pub fn new(pm1: f64, pm2_5: f64, pm10: f64, temperature: f64, humidity: f64) -> Self {
        Self {
            pm1,
            pm2_5,
            pm10,
            temperature,
            humidity,
            pressure: None,
            tvoc_index: None,
            particle_counts: None,
            battery: 0,
            charging: false,
            timestamp: Utc::now(),
            location_label: None,
        }
    }

    /// Check that every numeric field is finite.
    ///
    /// A non-finite value is a hard corruption signal: the frame must be
    /// dropped rather than surfaced.
    pub fn is_finite(&self) -> bool {
        let core_finite = self.pm1.is_finite()
            && self.pm2_5.is_finite()
            && self.pm10.is_finite()
            && self.temperature.is_finite()
            && self.humidity.is_finite();

        let optional_finite = self.pressure.map(f64::is_finite).unwrap_or(true)
            && self.tvoc_index.map(f64::is_finite).unwrap_or(true);

        core_finite && optional_finite
    }

    /// Check the expected size ordering of the PM fractions.
    ///
    /// PM1 particles are a subset of PM2.5 particles, which are a subset
    /// of PM10 particles, so pm1 <= pm2.5 <= pm10 physically. Sensor
    /// noise can violate this; callers log it, never reject on it.
    pub fn pm_ordering_holds(&self) -> bool {
        self.pm1 <= self.pm2_5 && self.pm2_5 <= self.pm10
    }

    /// Stamp the session's last-known power state onto the reading.
    pub fn with_power(mut self, battery: u8, charging: bool) -> Self {
        self.battery = battery;
        self.charging = charging;
        self
    }

    /// Attach an application-assigned location label.
    pub fn with_location(mut self, label: Option<String>) -> Self {
        self.location_label = label;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_defaults() {
        let reading = SensorReading::new(1.0, 2.0, 3.0, 21.5, 48.0);
        assert_eq!(reading.pm1, 1.0);
        assert_eq!(reading.pm2_5, 2.0);
        assert_eq!(reading.pm10, 3.0);
        assert_eq!(reading.battery, 0);
        assert!(!reading.charging);
        assert!(reading.pressure.is_none());
        assert!(reading.tvoc_index.is_none());
        assert!(reading.particle_counts.is_none());
        assert!(reading.location_label.is_none());
    }

    #[test]
    fn test_is_finite() {
        let reading = SensorReading::new(1.0, 2.0, 3.0, 21.5, 48.0);
        assert!(reading.is_finite());

        let mut bad = reading.clone();
        bad.temperature = f64::NAN;
        assert!(!bad.is_finite());

        let mut bad = reading.clone();
        bad.pm10 = f64::INFINITY;
        assert!(!bad.is_finite());

        let mut bad = reading.clone();
        bad.pressure = Some(f64::NAN);
        assert!(!bad.is_finite());

        let mut ok = reading;
        ok.pressure = Some(1013.2);
        assert!(ok.is_finite());
    }

    #[test]
    fn test_pm_ordering() {
        let reading = SensorReading::new(1.0, 2.0, 3.0, 21.5, 48.0);
        assert!(reading.pm_ordering_holds());

        let inverted = SensorReading::new(5.0, 2.0, 3.0, 21.5, 48.0);
        assert!(!inverted.pm_ordering_holds());
    }

    #[test]
    fn test_with_power_and_location() {
        let reading = SensorReading::new(1.0, 2.0, 3.0, 21.5, 48.0)
            .with_power(87, true)
            .with_location(Some("kitchen".to_string()));
        assert_eq!(reading.battery, 87);
        assert!(reading.charging);
        assert_eq!(reading.location_label.as_deref(), Some("kitchen"));
    }
}
