//! Protocol decoders for the supported device families.
//!
//! Decoders are infallible from the session's point of view: a malformed
//! payload produces no readings and the notification is dropped, the
//! session continues. Validation is two-tier — a non-finite value is a
//! hard corruption signal and kills the frame, while a merely implausible
//! finite value is logged and kept, because sensors legitimately report
//! extreme values during faults.

pub mod airbeam;
pub mod pmscan;

pub use airbeam::AirBeamDecoder;
pub use pmscan::PmScanDecoder;

use tracing::warn;

use crate::data::SensorReading;

/// Uniform decoder interface over one notification payload.
///
/// Binary families yield at most one reading per payload; line-oriented
/// families buffer across payloads and may complete zero or several
/// frames in a single call.
pub trait FrameDecoder: Send {
    /// Decode one notification payload into zero or more readings.
    fn decode(&mut self, payload: &[u8]) -> Vec<SensorReading>;
}

/// Upper PM concentration considered physically plausible, in µg/m³.
const PM_WARN_LIMIT: f64 = 1000.0;
/// Plausible temperature range in °C.
const TEMP_WARN_RANGE: std::ops::RangeInclusive<f64> = -20.0..=60.0;
/// Plausible relative humidity range in %RH.
const HUMIDITY_WARN_RANGE: std::ops::RangeInclusive<f64> = 0.0..=100.0;

/// Apply the two-tier validation to a decoded reading.
///
/// Returns `None` only for non-finite values. Out-of-range but finite
/// values and PM ordering violations are logged and the reading is kept.
pub fn validate(reading: SensorReading) -> Option<SensorReading> {
    if !reading.is_finite() {
        warn!("dropping frame with non-finite field");
        return None;
    }

    for (label, value) in [
        ("pm1", reading.pm1),
        ("pm2.5", reading.pm2_5),
        ("pm10", reading.pm10),
    ] {
        if value < 0.0 || value > PM_WARN_LIMIT {
            warn!("{} reading {} µg/m³ outside plausible range", label, value);
        }
    }

    if !TEMP_WARN_RANGE.contains(&reading.temperature) {
        warn!(
            "temperature reading {} °C outside plausible range",
            reading.temperature
        );
    }
    if !HUMIDITY_WARN_RANGE.contains(&reading.humidity) {
        warn!(
            "humidity reading {} %RH outside plausible range",
            reading.humidity
        );
    }

    if !reading.pm_ordering_holds() {
        warn!(
            "PM fractions out of order: pm1={} pm2.5={} pm10={}",
            reading.pm1, reading.pm2_5, reading.pm10
        );
    }

    Some(reading)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_non_finite() {
        let mut reading = SensorReading::new(1.0, 2.0, 3.0, 21.0, 50.0);
        reading.humidity = f64::NAN;
        assert!(validate(reading).is_none());

        let mut reading = SensorReading::new(1.0, 2.0, 3.0, 21.0, 50.0);
        reading.pressure = Some(f64::INFINITY);
        assert!(validate(reading).is_none());
    }

    #[test]
    fn test_validate_keeps_implausible_but_finite() {
        // Out of physical range, but finite: warn and keep.
        let reading = SensorReading::new(1.0, 1500.0, 1600.0, 85.0, 120.0);
        let validated = validate(reading);
        assert!(validated.is_some());
        assert_eq!(validated.map(|r| r.pm2_5), Some(1500.0));
    }

    #[test]
    fn test_validate_keeps_ordering_violations() {
        let reading = SensorReading::new(9.0, 5.0, 7.0, 21.0, 50.0);
        assert!(validate(reading).is_some());
    }
}
