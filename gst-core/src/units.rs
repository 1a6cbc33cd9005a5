//! Type-safe wrappers for physical units
//!
//! Newtype wrappers around f32 so a sample can't confuse engine speed with
//! wheel speed or a pedal position with a ratio.
//!
//! All unit types serialize with 4 decimal places to reduce JSON payload size.

use serde::{Deserialize, Serialize};

/// Round f32 to 4 decimal places for compact JSON serialization
fn round4<S: serde::Serializer>(val: &f32, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f32((*val * 10000.0).round() / 10000.0)
}

/// Meters per second
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct MetersPerSecond(#[serde(serialize_with = "round4")] pub f32);

/// Radians per second
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct RadiansPerSecond(#[serde(serialize_with = "round4")] pub f32);

/// Revolutions per minute
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct Rpm(#[serde(serialize_with = "round4")] pub f32);

impl Rpm {
    pub fn as_f64(self) -> f64 {
        self.0 as f64
    }
}

/// Newton-meters (torque)
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct NewtonMeters(#[serde(serialize_with = "round4")] pub f32);

/// Watts (power)
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct Watts(#[serde(serialize_with = "round4")] pub f32);

/// Percentage (0.0 to 1.0)
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct Percentage(#[serde(serialize_with = "round4")] pub f32);

impl Percentage {
    pub const ZERO: Percentage = Percentage(0.0);
    pub const FULL: Percentage = Percentage(1.0);

    /// Create a new percentage, clamping to [0.0, 1.0]
    pub fn new(value: f32) -> Self {
        Self(value.clamp(0.0, 1.0))
    }

    /// Build from a raw 8-bit pedal reading (0..=255)
    pub fn from_u8(raw: u8) -> Self {
        Self(raw as f32 / 255.0)
    }

    /// Get as percentage (0-100)
    pub fn as_percent(&self) -> f32 {
        self.0 * 100.0
    }

    pub fn is_full(&self) -> bool {
        self.0 >= 1.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 <= 0.0
    }
}

/// Number of telemetry samples at the 60 Hz tick rate converted to whole milliseconds
pub fn samples_to_ms(samples: f64, tick_rate: f64) -> i64 {
    (1000.0 * samples / tick_rate) as i64
}

/// Whole milliseconds converted to a number of samples at the given tick rate
pub fn ms_to_samples(ms: i64, tick_rate: f64) -> f64 {
    (tick_rate * ms as f64 / 1000.0).round()
}

/// Round to the nearest multiple of `step`
pub fn round_to(value: f64, step: f64) -> f64 {
    (value / step).round() * step
}
