//! PMScan binary frame decoding.
//!
//! PMScan frames are little-endian with fixed byte offsets and ÷10
//! fixed-point scaling:
//!
//! | Offset | Size | Field                                  |
//! |--------|------|----------------------------------------|
//! | 0      | 4    | measurement counter (u32)              |
//! | 4      | 2    | PM1.0, µg/m³ × 10 (u16)                |
//! | 6      | 2    | PM2.5, µg/m³ × 10 (u16)                |
//! | 8      | 2    | PM10, µg/m³ × 10 (u16)                 |
//! | 10     | 2    | temperature, °C × 10 (i16)             |
//! | 12     | 2    | humidity, %RH × 10 (u16)               |
//!
//! Longer frames append optional sections, each present only when the
//! payload is long enough (absence is not an error):
//!
//! | Offset | Size | Field                                  |
//! |--------|------|----------------------------------------|
//! | 14     | 8    | particle counts ≥0.3/0.5/1.0/2.5 µm (4×u16) |
//! | 22     | 8    | external temperature + humidity (2×f32) |
//! | 30     | 4    | pressure, hPa (f32)                    |
//! | 34     | 4    | TVOC index (f32)                       |
//!
//! When the external temperature/humidity section is present it replaces
//! the internal pair, which sits next to the electronics and reads warm.
//! Offsets reflect the firmware revisions seen so far and should be
//! confirmed against hardware before trusting a new revision.

use bytes::Buf;
use tracing::trace;

use super::{validate, FrameDecoder};
use crate::data::{ParticleCounts, SensorReading};

/// Minimum frame length carrying the core measurement fields.
pub const MIN_FRAME_LEN: usize = 14;

const BINS_END: usize = 22;
const EXTERNAL_END: usize = 30;
const PRESSURE_END: usize = 34;
const TVOC_END: usize = 38;

/// Stateless decoder for PMScan binary frames.
#[derive(Debug, Default)]
pub struct PmScanDecoder;

impl PmScanDecoder {
    /// Create a decoder.
    pub fn new() -> Self {
        Self
    }
}

impl FrameDecoder for PmScanDecoder {
    fn decode(&mut self, payload: &[u8]) -> Vec<SensorReading> {
        decode_frame(payload).into_iter().collect()
    }
}

/// The measurement counter of a frame, without decoding the rest.
///
/// The counter doubles as the protocol's session identifier: the first
/// frame's counter names the session.
pub fn frame_counter(payload: &[u8]) -> Option<u32> {
    if payload.len() < MIN_FRAME_LEN {
        return None;
    }
    let mut buf = payload;
    Some(buf.get_u32_le())
}

/// Decode one PMScan frame.
///
/// Returns `None` for frames that are too short or carry non-finite
/// values; implausible finite values are logged and kept.
///
/// # Example
///
/// ```
/// use airsense_ble::protocol::pmscan::decode_frame;
///
/// // counter=1, pm1=120.0, pm2.5=250.0, pm10=450.0, temp=22.1, rh=55.1
/// let frame = [
///     0x01, 0x00, 0x00, 0x00, // counter
///     0xB0, 0x04, // 1200 -> 120.0 µg/m³
///     0xC4, 0x09, // 2500 -> 250.0 µg/m³
///     0x94, 0x11, // 4500 -> 450.0 µg/m³
///     0xDD, 0x00, // 221 -> 22.1 °C
///     0x27, 0x02, // 551 -> 55.1 %RH
/// ];
/// let reading = decode_frame(&frame).unwrap();
/// assert_eq!(reading.pm2_5, 250.0);
/// assert_eq!(reading.temperature, 22.1);
/// ```
pub fn decode_frame(payload: &[u8]) -> Option<SensorReading> {
    if payload.len() < MIN_FRAME_LEN {
        trace!("frame too short: {} bytes", payload.len());
        return None;
    }

    let mut buf = payload;
    let _counter = buf.get_u32_le();
    let pm1 = buf.get_u16_le() as f64 / 10.0;
    let pm2_5 = buf.get_u16_le() as f64 / 10.0;
    let pm10 = buf.get_u16_le() as f64 / 10.0;
    let mut temperature = buf.get_i16_le() as f64 / 10.0;
    let mut humidity = buf.get_u16_le() as f64 / 10.0;

    let mut particle_counts = None;
    if payload.len() >= BINS_END {
        particle_counts = Some(ParticleCounts {
            um0_3: buf.get_u16_le() as u32,
            um0_5: buf.get_u16_le() as u32,
            um1_0: buf.get_u16_le() as u32,
            um2_5: buf.get_u16_le() as u32,
        });
    }

    if payload.len() >= EXTERNAL_END {
        temperature = buf.get_f32_le() as f64;
        humidity = buf.get_f32_le() as f64;
    }

    let mut pressure = None;
    if payload.len() >= PRESSURE_END {
        pressure = Some(buf.get_f32_le() as f64);
    }

    let mut tvoc_index = None;
    if payload.len() >= TVOC_END {
        tvoc_index = Some(buf.get_f32_le() as f64);
    }

    let mut reading = SensorReading::new(pm1, pm2_5, pm10, temperature, humidity);
    reading.particle_counts = particle_counts;
    reading.pressure = pressure;
    reading.tvoc_index = tvoc_index;

    validate(reading)
}
