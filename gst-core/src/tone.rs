//! Tone offset calibration
//!
//! The tone offset is the lead time, in samples, between the cue and the
//! moment the player actually shifts. It is learned from observed shifts:
//! counting starts when a cue fires and stops at the detected shift point.

use crate::config::ToneConfig;
use crate::model::Sample;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info};

/// Samples kept by the shift detector
pub const DETECTOR_CAPACITY: usize = 120;

/// Learned lead time with a bounded rolling history
#[derive(Debug, Clone, PartialEq)]
pub struct ToneOffset {
    config: ToneConfig,
    value: f64,
    counter: Option<i64>,
    history: VecDeque<f64>,
    /// Seed entries still in the history
    seeds: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToneOffsetInfo {
    pub value: f64,
    pub dynamic: bool,
    pub history_len: usize,
    pub seeds: usize,
}

impl ToneOffset {
    pub fn new(config: ToneConfig) -> Self {
        let value = config.default;
        let mut tone = Self {
            config,
            value,
            counter: None,
            history: VecDeque::new(),
            seeds: 0,
        };
        tone.reseed();
        tone
    }

    fn reseed(&mut self) {
        self.history.clear();
        self.history
            .extend(std::iter::repeat(self.value).take(self.config.history_min));
        self.seeds = self.config.history_min;
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn counter(&self) -> Option<i64> {
        self.counter
    }

    /// Start counting samples after a cue
    pub fn start_counter(&mut self) {
        self.counter = Some(0);
    }

    pub fn increment_counter(&mut self) {
        if let Some(counter) = self.counter.as_mut() {
            *counter += 1;
        }
    }

    pub fn decrement_counter(&mut self) {
        if let Some(counter) = self.counter.as_mut() {
            *counter -= 1;
        }
    }

    pub fn reset_counter(&mut self) {
        self.counter = None;
    }

    /// Record the counted lead time; returns the new value if it changed
    ///
    /// Negative counts and counts above the outlier bound are discarded.
    /// Seed entries are replaced first, then the history grows to its cap.
    pub fn finish_counter(&mut self) -> Option<f64> {
        let counter = self.counter.take()?;
        if !self.config.dynamic {
            return None;
        }

        if counter < 0 {
            debug!("Tone offset: erroneous lead of {} samples discarded", counter);
            return None;
        }
        if counter as f64 > self.config.outlier {
            debug!("Tone offset: outlier lead of {} samples discarded", counter);
            return None;
        }

        if self.seeds > 0 {
            self.history.pop_front();
            self.seeds -= 1;
        }
        let value = (counter as f64).clamp(self.config.lower, self.config.upper);
        self.history.push_back(value);
        while self.history.len() > self.config.history_max {
            self.history.pop_front();
        }

        let mean = self.history.iter().sum::<f64>() / self.history.len() as f64;
        let rounded = (mean * 10.0).round() / 10.0;
        debug!("Tone offset {:.1}, new average {:.2}", self.value, mean);
        if rounded != self.value {
            info!("Tone offset changed from {:.1} to {:.1}", self.value, rounded);
            self.value = rounded;
            return Some(rounded);
        }
        None
    }

    /// Fix the offset to `value` and restart learning from it
    pub fn set_manual(&mut self, value: f64) -> f64 {
        self.value = value.clamp(self.config.lower, self.config.upper);
        self.counter = None;
        self.reseed();
        self.value
    }

    pub fn info(&self) -> ToneOffsetInfo {
        ToneOffsetInfo {
            value: self.value,
            dynamic: self.config.dynamic,
            history_len: self.history.len(),
            seeds: self.seeds,
        }
    }
}

/// Outcome of feeding a sample to the shift detector
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// Same gear, or first sample
    None,
    /// Gear went down; any pending measurement is cancelled
    Downshift,
    /// Gear went up
    Upshift {
        /// Gear shifted out of
        from_gear: i8,
        /// RPM at the true shift point, if one was found
        shift_rpm: Option<f64>,
        /// Samples from cue to shift, if a cue was pending
        counter: Option<i64>,
    },
}

/// Finds the RPM at which the player really started an upshift
///
/// Games cut power before the clutch disengages, so the sample where the
/// gear number changes is too late. Walking back from it, past the
/// out-of-gear stretch, the last full-throttle sample before the throttle
/// dropped is the shift point.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShiftDetector {
    /// Newest first
    samples: VecDeque<Sample>,
}

impl ShiftDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, sample: &Sample, tone: &mut ToneOffset) -> Detection {
        let front_gear = self.samples.front().map(|s| s.gear);
        match front_gear {
            None => {}
            Some(gear) if gear == sample.gear => {}
            Some(gear) if gear > sample.gear => {
                self.samples.clear();
                tone.reset_counter();
                return Detection::Downshift;
            }
            Some(_) => return self.walk_back(sample, tone),
        }

        self.samples.push_front(sample.clone());
        self.samples.truncate(DETECTOR_CAPACITY);
        tone.increment_counter();
        Detection::None
    }

    fn walk_back(&mut self, current: &Sample, tone: &mut ToneOffset) -> Detection {
        let mut prev = current;
        let mut gear_change = false;
        let mut shift_rpm = None;

        for sample in &self.samples {
            if sample.throttle.is_zero() {
                break;
            }
            if !prev.in_gear && sample.in_gear {
                gear_change = true;
            }
            if gear_change && !prev.throttle.is_full() && sample.throttle.is_full() {
                shift_rpm = Some(sample.rpm());
                break;
            }
            prev = sample;
            tone.decrement_counter();
        }

        self.samples.clear();
        Detection::Upshift {
            from_gear: current.gear - 1,
            shift_rpm,
            counter: tone.counter(),
        }
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
