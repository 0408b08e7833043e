//! Percent ↔ fraction conversion. Callers outside the crate speak percent;
//! everything under `core` works in fractions. Conversion happens here and
//! nowhere else.

pub fn percent_to_fraction(percent: f64) -> f64 {
    percent / 100.0
}

pub fn fraction_to_percent(fraction: f64) -> f64 {
    fraction * 100.0
}

/// Whole-number percentage for allocation labels.
pub fn fraction_to_whole_percent(fraction: f64) -> u32 {
    fraction_to_percent(fraction).round().max(0.0) as u32
}
