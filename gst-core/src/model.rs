//! Telemetry sample model
//!
//! Defines the `Sample` structure that every sample source converts to.
//! Decoding of vendor packets happens upstream; by the time a sample reaches
//! the engine it is plain, normalized data.
//!
//! Conventions:
//! - Pedals are `Percentage` in [0, 1]; the clutch is 0.0 when engaged and
//!   1.0 when fully disengaged.
//! - Gear is -1 for reverse, 0 for neutral, 1+ for forward gears.

use crate::units::*;
use serde::{Deserialize, Serialize};

/// Highest forward gear the engine tracks
pub const MAX_GEARS: usize = 10;

/// Drivetrain layout, used to pick the driven wheels and the variance bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Drivetrain {
    Fwd,
    #[default]
    Rwd,
    Awd,
}

/// Angular wheel speed per corner (rad/s)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WheelSpeeds {
    pub front_left: RadiansPerSecond,
    pub front_right: RadiansPerSecond,
    pub rear_left: RadiansPerSecond,
    pub rear_right: RadiansPerSecond,
}

impl WheelSpeeds {
    /// All four wheels turning at the same speed
    pub fn uniform(speed: RadiansPerSecond) -> Self {
        Self {
            front_left: speed,
            front_right: speed,
            rear_left: speed,
            rear_right: speed,
        }
    }

    pub fn front_average(&self) -> f64 {
        (self.front_left.0 as f64 + self.front_right.0 as f64) / 2.0
    }

    pub fn rear_average(&self) -> f64 {
        (self.rear_left.0 as f64 + self.rear_right.0 as f64) / 2.0
    }

    /// Average angular speed of the wheels that carry drive for this layout.
    ///
    /// AWD only considers the rear axle: front and rear tyres may differ in
    /// size and slip, and only relative ratios matter downstream.
    pub fn driven_average(&self, drivetrain: Drivetrain) -> f64 {
        match drivetrain {
            Drivetrain::Fwd => self.front_average(),
            Drivetrain::Rwd | Drivetrain::Awd => self.rear_average(),
        }
    }
}

/// One telemetry frame
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Sample {
    /// Monotonically increasing packet index
    pub index: u64,

    /// Car identity ordinal
    pub car_ordinal: i32,

    // === Engine ===
    pub rpm: Rpm,

    /// RPM at which the in-game rev bar starts warning
    pub upshift_rpm: Rpm,

    /// Maximum engine RPM reported by the game (above the usable rev limit)
    pub engine_max_rpm: Rpm,

    /// Boost pressure (bar, relative)
    pub boost: f32,

    /// Native engine torque, for games that report it
    pub torque: Option<NewtonMeters>,

    /// Native engine power, for games that report it
    pub power: Option<Watts>,

    // === Drivetrain ===
    /// Current gear (-1 = reverse, 0 = neutral, 1+ = forward gears)
    pub gear: i8,

    /// False while a gear change is in progress
    pub in_gear: bool,

    pub drivetrain: Drivetrain,

    /// Number of forward gears, for sources that report the gearbox
    pub gear_count: Option<u8>,

    // === Motion ===
    /// Speed in m/s
    pub speed: MetersPerSecond,

    pub wheel_speeds: WheelSpeeds,

    // === Inputs ===
    pub throttle: Percentage,
    pub brake: Percentage,

    /// Clutch input (0.0 = engaged, 1.0 = disengaged)
    pub clutch: Percentage,
    pub handbrake: bool,

    // === Session flags ===
    /// False in replays and menus
    pub on_track: bool,
    pub loading: bool,
    pub paused: bool,
}

impl Sample {
    pub fn rpm(&self) -> f64 {
        self.rpm.as_f64()
    }

    /// Gear as a tracker index when it is a valid forward gear
    pub fn forward_gear(&self) -> Option<usize> {
        match self.gear {
            g if g >= 1 && (g as usize) <= MAX_GEARS => Some(g as usize),
            _ => None,
        }
    }

    pub fn clutch_engaged(&self) -> bool {
        self.clutch.is_zero()
    }

    pub fn clutch_disengaged(&self) -> bool {
        self.clutch.is_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_gear_bounds() {
        let mut sample = Sample::default();
        assert_eq!(sample.forward_gear(), None);

        sample.gear = -1;
        assert_eq!(sample.forward_gear(), None);

        sample.gear = 1;
        assert_eq!(sample.forward_gear(), Some(1));

        sample.gear = MAX_GEARS as i8;
        assert_eq!(sample.forward_gear(), Some(MAX_GEARS));

        sample.gear = MAX_GEARS as i8 + 1;
        assert_eq!(sample.forward_gear(), None);
    }

    #[test]
    fn test_driven_average_per_layout() {
        let wheels = WheelSpeeds {
            front_left: RadiansPerSecond(10.0),
            front_right: RadiansPerSecond(12.0),
            rear_left: RadiansPerSecond(20.0),
            rear_right: RadiansPerSecond(22.0),
        };
        assert_eq!(wheels.driven_average(Drivetrain::Fwd), 11.0);
        assert_eq!(wheels.driven_average(Drivetrain::Rwd), 21.0);
        assert_eq!(wheels.driven_average(Drivetrain::Awd), 21.0);
    }

    #[test]
    fn test_drivetrain_serialization() {
        let json = serde_json::to_string(&Drivetrain::Awd).unwrap();
        assert_eq!(json, "\"awd\"");

        let deserialized: Drivetrain = serde_json::from_str("\"fwd\"").unwrap();
        assert_eq!(deserialized, Drivetrain::Fwd);
    }

    #[test]
    fn test_sample_serialization_roundtrip() {
        let sample = Sample {
            index: 42,
            car_ordinal: 3387,
            rpm: Rpm(6200.0),
            gear: 3,
            in_gear: true,
            throttle: Percentage::FULL,
            torque: Some(NewtonMeters(410.0)),
            on_track: true,
            ..Default::default()
        };
        let json = serde_json::to_string(&sample).unwrap();
        let deserialized: Sample = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.index, 42);
        assert_eq!(deserialized.gear, 3);
        assert_eq!(deserialized.torque, Some(NewtonMeters(410.0)));
        assert!(deserialized.throttle.is_full());
    }
}
