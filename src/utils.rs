//! Utility functions for the airsense-ble crate.

/// US EPA AQI breakpoint: (concentration low, concentration high,
/// index low, index high).
type Breakpoint = (f64, f64, f64, f64);

const PM25_BREAKPOINTS: [Breakpoint; 7] = [
    (0.0, 12.0, 0.0, 50.0),
    (12.1, 35.4, 51.0, 100.0),
    (35.5, 55.4, 101.0, 150.0),
    (55.5, 150.4, 151.0, 200.0),
    (150.5, 250.4, 201.0, 300.0),
    (250.5, 350.4, 301.0, 400.0),
    (350.5, 500.4, 401.0, 500.0),
];

const PM10_BREAKPOINTS: [Breakpoint; 7] = [
    (0.0, 54.0, 0.0, 50.0),
    (55.0, 154.0, 51.0, 100.0),
    (155.0, 254.0, 101.0, 150.0),
    (255.0, 354.0, 151.0, 200.0),
    (355.0, 424.0, 201.0, 300.0),
    (425.0, 504.0, 301.0, 400.0),
    (505.0, 604.0, 401.0, 500.0),
];

fn interpolate(concentration: f64, breakpoints: &[Breakpoint]) -> Option<u16> {
    if !concentration.is_finite() || concentration < 0.0 {
        return None;
    }

    let last = breakpoints.last()?;
    if concentration > last.1 {
        // Beyond the table the scale is pinned at its ceiling.
        return Some(last.3 as u16);
    }

    for &(c_lo, c_hi, i_lo, i_hi) in breakpoints {
        if concentration <= c_hi {
            let index = (i_hi - i_lo) / (c_hi - c_lo) * (concentration - c_lo) + i_lo;
            return Some(index.round() as u16);
        }
    }
    None
}

/// Convert a PM2.5 concentration (µg/m³) to the US EPA AQI.
///
/// Returns `None` for negative or non-finite concentrations.
///
/// # Example
///
/// ```
/// use airsense_ble::utils::pm25_to_aqi;
///
/// assert_eq!(pm25_to_aqi(12.0), Some(50));
/// assert_eq!(pm25_to_aqi(35.4), Some(100));
/// ```
pub fn pm25_to_aqi(concentration: f64) -> Option<u16> {
    interpolate(concentration, &PM25_BREAKPOINTS)
}

/// Convert a PM10 concentration (µg/m³) to the US EPA AQI.
///
/// Returns `None` for negative or non-finite concentrations.
pub fn pm10_to_aqi(concentration: f64) -> Option<u16> {
    interpolate(concentration, &PM10_BREAKPOINTS)
}
