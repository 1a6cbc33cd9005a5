//! GT Shift Tone Core Library
//!
//! This crate learns an engine's torque curve and gear ratios from live
//! telemetry samples, derives the optimal upshift RPM for every gear and
//! predicts when to play a shift cue so the player hears it in time.

pub mod adapter;
pub mod collector;
pub mod config;
pub mod curve;
pub mod engine;
pub mod gear;
pub mod history;
pub mod lookahead;
pub mod model;
pub mod predictor;
pub mod tone;
pub mod units;

pub use adapter::SampleSource;
pub use config::{ConfigError, ShiftConfig};
pub use curve::{CurveError, EngineCurve, PowerUnit};
pub use engine::{EngineEvent, EngineSnapshot, ShiftEngine, TickOutput};
pub use history::ShiftRecord;
pub use model::{Drivetrain, Sample, WheelSpeeds};
pub use predictor::{CueTrigger, ShiftCue};
