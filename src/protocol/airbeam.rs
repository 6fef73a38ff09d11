//! AirBeam textual frame decoding.
//!
//! AirBeam streams UTF-8 line-oriented frames over a single notify
//! characteristic. A frame can be split across BLE notification packets
//! at arbitrary byte boundaries, so the decoder buffers until a newline
//! and only then parses the complete line.
//!
//! Three formats are attempted in order:
//!
//! 1. whitespace-separated fixed-width vector, field indices from the
//!    configured [`TextLayout`];
//! 2. the same vector comma-separated (some firmware revisions switch
//!    delimiter);
//! 3. a reduced three-field form: temperature, humidity, PM2.5.
//!
//! A fixed-width parse that yields PM values outside 0..2000 µg/m³ is
//! treated as a mis-parse and the fallbacks are tried.

use tracing::{trace, warn};

use super::{validate, FrameDecoder};
use crate::config::TextLayout;
use crate::data::SensorReading;

/// A line longer than this without a newline is discarded as garbage.
const MAX_LINE_LEN: usize = 512;

/// Upper bound of the PM plausibility gate used to detect mis-parses.
const PM_PLAUSIBLE_LIMIT: f64 = 2000.0;

/// Buffering decoder for AirBeam line-oriented frames.
#[derive(Debug)]
pub struct AirBeamDecoder {
    layout: TextLayout,
    buffer: Vec<u8>,
}

impl AirBeamDecoder {
    /// Create a decoder with the given field layout.
    pub fn new(layout: TextLayout) -> Self {
        Self {
            layout,
            buffer: Vec::new(),
        }
    }

    /// Bytes currently buffered awaiting a newline.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for AirBeamDecoder {
    fn default() -> Self {
        Self::new(TextLayout::default())
    }
}

impl FrameDecoder for AirBeamDecoder {
    fn decode(&mut self, payload: &[u8]) -> Vec<SensorReading> {
        self.buffer.extend_from_slice(payload);

        let mut readings = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = match std::str::from_utf8(&line_bytes) {
                Ok(text) => text.trim(),
                Err(_) => {
                    warn!("dropping non-UTF-8 line of {} bytes", line_bytes.len());
                    continue;
                }
            };
            if line.is_empty() {
                continue;
            }
            trace!("complete line: {:?}", line);
            if let Some(reading) = parse_line(line, &self.layout) {
                readings.push(reading);
            }
        }

        if self.buffer.len() > MAX_LINE_LEN {
            warn!(
                "discarding {} buffered bytes with no line terminator",
                self.buffer.len()
            );
            self.buffer.clear();
        }

        readings
    }
}

/// Parse one complete line, trying each format in order.
pub fn parse_line(line: &str, layout: &TextLayout) -> Option<SensorReading> {
    let candidate = parse_vector(line, layout, char::is_whitespace)
        .filter(pm_plausible)
        .or_else(|| parse_vector(line, layout, |c| c == ',').filter(pm_plausible))
        .or_else(|| parse_reduced(line));

    candidate.and_then(validate)
}

/// Whether every PM field sits inside the plausibility gate.
fn pm_plausible(reading: &SensorReading) -> bool {
    [reading.pm1, reading.pm2_5, reading.pm10]
        .iter()
        .all(|pm| (0.0..=PM_PLAUSIBLE_LIMIT).contains(pm) || pm.is_nan())
}

/// Parse the fixed-width field vector with the given delimiter class.
fn parse_vector(
    line: &str,
    layout: &TextLayout,
    delimiter: impl Fn(char) -> bool,
) -> Option<SensorReading> {
    let tokens: Vec<&str> = line
        .split(delimiter)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();

    if tokens.len() < layout.min_fields {
        return None;
    }

    let field = |index: usize| -> Option<f64> { tokens.get(index)?.parse().ok() };

    Some(SensorReading::new(
        field(layout.pm1)?,
        field(layout.pm2_5)?,
        field(layout.pm10)?,
        field(layout.temperature)?,
        field(layout.humidity)?,
    ))
}

/// Parse the reduced three-field form: temperature, humidity, PM2.5.
///
/// The family omits PM1 in this form, reported as 0; PM10 is reported as
/// the PM2.5 value, since the coarse fraction contains the fine one.
fn parse_reduced(line: &str) -> Option<SensorReading> {
    let tokens: Vec<&str> = line
        .split(|c: char| c.is_whitespace() || c == ',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();

    if tokens.len() != 3 {
        return None;
    }

    let temperature: f64 = tokens[0].parse().ok()?;
    let humidity: f64 = tokens[1].parse().ok()?;
    let pm2_5: f64 = tokens[2].parse().ok()?;

    Some(SensorReading::new(0.0, pm2_5, pm2_5, temperature, humidity))
}
