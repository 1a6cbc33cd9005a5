//! Telemetry sample sources for GT Shift Tone

pub mod demo;

pub use demo::DemoAdapter;
