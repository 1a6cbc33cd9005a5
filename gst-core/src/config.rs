//! Engine configuration
//!
//! Every threshold the engine uses lives here and is passed into constructors.
//! All sections deserialize with defaults, so a partial JSON document is valid.

use crate::model::Drivetrain;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be positive and finite, got {value}")]
    NotPositive { field: &'static str, value: f64 },

    #[error("{field} must list at least one window, all non-zero")]
    BadWindows { field: &'static str },
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShiftConfig {
    /// Samples per second delivered by the game
    pub tick_rate: f64,

    pub accel: AccelConfig,
    pub drag: DragConfig,
    pub curve: CurveConfig,
    pub gears: GearConfig,
    pub lookahead: LookaheadConfig,
    pub tone: ToneConfig,
    pub cue: CueConfig,

    /// Fraction of the engine max RPM the raw RPM must move before the
    /// filtered value follows it (0 disables the filter)
    pub hysteresis_percent: f64,

    /// Process samples while the game reports no car on track (replays)
    pub include_replay: bool,

    /// RPM subtracted from the engine max RPM to guess a rev limit while no
    /// curve is available
    pub revlimit_guess: f64,
}

impl Default for ShiftConfig {
    fn default() -> Self {
        Self {
            tick_rate: 60.0,
            accel: AccelConfig::default(),
            drag: DragConfig::default(),
            curve: CurveConfig::default(),
            gears: GearConfig::default(),
            lookahead: LookaheadConfig::default(),
            tone: ToneConfig::default(),
            cue: CueConfig::default(),
            hysteresis_percent: 0.0,
            include_replay: false,
            revlimit_guess: 750.0,
        }
    }
}

impl ShiftConfig {
    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("tick_rate", self.tick_rate),
            ("curve.rpm_interval", self.curve.rpm_interval),
        ] {
            if !(value > 0.0 && value.is_finite()) {
                return Err(ConfigError::NotPositive { field, value });
            }
        }
        for (field, windows) in [
            ("curve.smoothing_windows", &self.curve.smoothing_windows),
            ("curve.drag_smoothing_windows", &self.curve.drag_smoothing_windows),
        ] {
            if windows.is_empty() || windows.contains(&0) {
                return Err(ConfigError::BadWindows { field });
            }
        }
        Ok(())
    }
}

// === Run collection ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccelConfig {
    /// Minimum number of samples in a valid run
    pub min_len: usize,

    /// Consecutive samples at or below the peak that confirm the rev limiter
    pub revlimit_bounce: usize,

    /// Keep the limiter bounce samples in the finished run
    pub keep_overflow: bool,
}

impl Default for AccelConfig {
    fn default() -> Self {
        Self {
            min_len: 90,
            revlimit_bounce: 15,
            keep_overflow: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DragConfig {
    pub min_duration_secs: f64,

    /// Throttle above which a coast is considered finished
    pub throttle_release: f32,
}

impl Default for DragConfig {
    fn default() -> Self {
        Self {
            min_duration_secs: 5.0,
            throttle_release: 4.0 / 255.0,
        }
    }
}

// === Curve building ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurveConfig {
    /// Rolling average windows applied in order to the accel velocity trace
    pub smoothing_windows: Vec<usize>,

    /// Rolling average windows applied to the drag velocity trace
    pub drag_smoothing_windows: Vec<usize>,

    /// RPM spacing of the resampled curve
    pub rpm_interval: f64,

    /// Highest power of velocity in the drag fit (1 or 2)
    pub drag_fit_degree: usize,

    /// The rev limit is rounded to a multiple of this
    pub revlimit_round: f64,

    /// Points within this distance below the rev limit count as reaching it
    pub revlimit_round_offset: f64,

    /// Maximum span of a self-intersection loop removed from the trace
    pub max_loop: usize,
}

impl Default for CurveConfig {
    fn default() -> Self {
        Self {
            smoothing_windows: vec![3, 21],
            drag_smoothing_windows: vec![21],
            rpm_interval: 100.0,
            drag_fit_degree: 2,
            revlimit_round: 50.0,
            revlimit_round_offset: 25.0,
            max_loop: 50,
        }
    }
}

// === Gear tracking ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GearConfig {
    /// Minimum speed in m/s before a ratio is derived
    pub min_speed: f32,

    /// Capacity of the rolling ratio window
    pub window_len: usize,

    /// Samples needed before median and variance are computed
    pub min_fill: usize,

    /// Samples needed before a gear may lock
    pub lock_samples: usize,

    pub variance_bounds: VarianceBounds,
}

impl Default for GearConfig {
    fn default() -> Self {
        Self {
            min_speed: 3.0,
            window_len: 60,
            min_fill: 10,
            lock_samples: 40,
            variance_bounds: VarianceBounds::default(),
        }
    }
}

/// Ratio variance below which a gear locks, per drivetrain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VarianceBounds {
    pub fwd: f64,
    pub rwd: f64,
    pub awd: f64,
}

impl Default for VarianceBounds {
    fn default() -> Self {
        Self {
            fwd: 1e-4,
            rwd: 1e-4,
            awd: 1e-4,
        }
    }
}

impl VarianceBounds {
    pub fn for_drivetrain(&self, drivetrain: Drivetrain) -> f64 {
        match drivetrain {
            Drivetrain::Fwd => self.fwd,
            Drivetrain::Rwd => self.rwd,
            Drivetrain::Awd => self.awd,
        }
    }
}

// === Prediction ===

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LookaheadConfig {
    pub min_len: usize,
    pub max_len: usize,
}

impl Default for LookaheadConfig {
    fn default() -> Self {
        Self {
            min_len: 15,
            max_len: 20,
        }
    }
}

/// Lead time calibration, all values in samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToneConfig {
    pub default: f64,
    pub lower: f64,
    pub upper: f64,

    /// Observations above this are discarded
    pub outlier: f64,

    pub history_min: usize,
    pub history_max: usize,

    /// Learn the offset from observed shifts
    pub dynamic: bool,
}

impl Default for ToneConfig {
    fn default() -> Self {
        Self {
            default: 17.0,
            lower: 9.0,
            upper: 25.0,
            outlier: 30.0,
            history_min: 35,
            history_max: 75,
            dynamic: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CueConfig {
    /// Fraction of the rev limit used as a second target
    pub revlimit_percent: f64,

    /// Extra lead in samples for the rev limit target
    pub revlimit_offset: f64,

    /// Cues only fire at or above this throttle
    pub min_throttle: f32,

    /// Samples between cues
    pub cooldown: u32,

    /// Fraction of the shift RPM below which the cooldown re-arms
    pub rearm_percent: f64,
}

impl Default for CueConfig {
    fn default() -> Self {
        Self {
            revlimit_percent: 0.996,
            revlimit_offset: 5.0,
            min_throttle: 1.0,
            cooldown: 30,
            rearm_percent: 0.75,
        }
    }
}
