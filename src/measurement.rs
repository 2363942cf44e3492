//! Caliper measurement state.
//!
//! Readings are integers in hundredths of a millimetre. Every raw reading has the zero
//! offset added before it is published; the difference between the last two published
//! readings is the delta the capture sequencer watches to decide that the jaws have
//! stopped moving.
//!
//! The state is shared between the caliper line listener, which writes it, and the
//! capture sequencer, which reads it, through [`SharedMeasurement`].

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::classify::{Classification, Classifier};

/// Measurement state shared between the caliper listener and the sequencer.
pub type SharedMeasurement = Arc<Mutex<MeasurementState>>;

/// Latest caliper readings and their classification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeasurementState {
    last_raw: Option<i64>,
    current: Option<i64>,
    previous: Option<i64>,
    zero_offset: i64,
    classification: Option<Classification>,
}

impl MeasurementState {
    /// Empty state with no offset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a fresh state for sharing.
    pub fn shared() -> SharedMeasurement {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Publish a raw reading. Returns the offset-adjusted value.
    ///
    /// A reading that overflows once offset is rejected and leaves the state unchanged.
    pub fn record(&mut self, raw: i64) -> Option<i64> {
        let Some(published) = raw.checked_add(self.zero_offset) else {
            debug!(raw, offset = self.zero_offset, "Rejecting out-of-range reading");
            return None;
        };
        self.last_raw = Some(raw);
        self.previous = self.current;
        self.current = Some(published);
        Some(published)
    }

    /// Publish a raw reading and classify the published value.
    pub fn record_classified(&mut self, raw: i64, classifier: &dyn Classifier) -> Option<i64> {
        let published = self.record(raw)?;
        self.classification = classifier.classify(published);
        Some(published)
    }

    /// Latest published reading.
    pub fn current(&self) -> Option<i64> {
        self.current
    }

    /// Reading published before the latest one.
    pub fn previous(&self) -> Option<i64> {
        self.previous
    }

    /// Change between the last two readings, once there are two and the change fits.
    pub fn delta(&self) -> Option<i64> {
        self.current?.checked_sub(self.previous?)
    }

    /// Whether the last change was larger than `threshold` in either direction.
    ///
    /// Without two readings there is no movement, so this is `false`.
    pub fn delta_exceeds(&self, threshold: i64) -> bool {
        match (self.current, self.previous) {
            (Some(current), Some(previous)) => {
                i128::from(current.abs_diff(previous)) > i128::from(threshold)
            }
            _ => false,
        }
    }

    /// Latest accepted reading before the offset.
    pub fn last_raw(&self) -> Option<i64> {
        self.last_raw
    }

    /// Offset added to raw readings.
    pub fn zero_offset(&self) -> i64 {
        self.zero_offset
    }

    /// Classification of the latest reading.
    pub fn classification(&self) -> Option<&Classification> {
        self.classification.as_ref()
    }

    /// Choose the offset so the current position reads as `target`.
    ///
    /// The offset is derived from the raw reading, so zeroing twice in a row gives the
    /// same result. Takes effect from the next reading. Returns the new offset, or
    /// `None` when nothing has been read yet or the offset would not fit.
    pub fn zero_to(&mut self, target: i64) -> Option<i64> {
        let raw = self.last_raw?;
        self.zero_offset = target.checked_sub(raw)?;
        Some(self.zero_offset)
    }
}

/// Parse a caliper line the way a lenient integer parse would.
///
/// Leading and trailing whitespace is ignored, an optional sign and the leading run of
/// digits are taken, and anything after them is ignored. Returns `None` without digits.
pub fn parse_reading(line: &str) -> Option<i64> {
    let trimmed = line.trim();
    let (negative, digits) = match trimmed.as_bytes().first() {
        Some(b'-') => (true, &trimmed[1..]),
        Some(b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };

    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }

    let magnitude: i64 = digits[..end].parse().ok()?;
    Some(if negative { -magnitude } else { magnitude })
}

/// Format a reading in millimetres with two decimals (`1234` → `"12.34"`).
pub fn format_millimetres(hundredths: i64) -> String {
    let sign = if hundredths < 0 { "-" } else { "" };
    let abs = hundredths.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

/// Convert millimetres to hundredths, rounding to the nearest hundredth.
pub fn millimetres_to_hundredths(millimetres: f64) -> i64 {
    (millimetres * 100.0).round() as i64
}
