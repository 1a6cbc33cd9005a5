//! Shift cue prediction
//!
//! A cue fires when the forecast RPM reaches a target within the tone
//! offset. Targets are the shift RPM of the current gear and two rev limit
//! guards. The RPM slope is scaled by the torque ratio between the target and
//! the current RPM, since the engine pulls slower where it makes less torque.

use crate::config::CueConfig;
use crate::curve::EngineCurve;
use crate::lookahead::Lookahead;
use crate::model::Sample;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Which target made a cue fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CueTrigger {
    /// Shift RPM of the current gear reached within the tone offset
    ShiftRpm,
    /// A fraction of the rev limit reached within the tone offset
    RevlimitPercent,
    /// Rev limit reached within the tone offset plus a margin
    RevlimitTime,
}

/// A fired shift cue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShiftCue {
    pub index: u64,
    pub gear: i8,
    /// RPM when the cue fired
    pub rpm: f64,
    /// Lowest target among the triggers
    pub target_rpm: f64,
    pub tone_offset: f64,
    pub triggers: Vec<CueTrigger>,
}

/// Everything the predictor reads for one sample
#[derive(Debug, Clone, Copy)]
pub struct CueInputs<'a> {
    pub sample: &'a Sample,
    /// Hysteresis RPM of this sample
    pub rpm: f64,
    pub lookahead: &'a Lookahead,
    pub curve: Option<&'a EngineCurve>,
    pub shift_rpm: Option<f64>,
    pub revlimit: Option<f64>,
    pub tone_offset: f64,
    pub is_highest: bool,
}

/// Fires cues and enforces the cooldown between them
#[derive(Debug, Clone, PartialEq)]
pub struct ShiftPredictor {
    config: CueConfig,
    cooldown: u32,
}

impl ShiftPredictor {
    pub fn new(config: CueConfig) -> Self {
        Self {
            config,
            cooldown: 0,
        }
    }

    /// Samples left before another cue may fire
    pub fn cooldown(&self) -> u32 {
        self.cooldown
    }

    pub fn evaluate(&mut self, inputs: CueInputs<'_>) -> Option<ShiftCue> {
        if inputs.is_highest {
            return None;
        }

        if self.cooldown == 0 {
            let cue = self.test(&inputs);
            if cue.is_some() {
                self.cooldown = self.config.cooldown;
            }
            return cue;
        }

        match inputs.shift_rpm {
            Some(shift_rpm) if inputs.rpm < (shift_rpm * self.config.rearm_percent).ceil() => {
                debug!("Cue rearmed at {:.0} RPM", inputs.rpm);
                self.cooldown = 0;
            }
            Some(shift_rpm) if inputs.rpm >= shift_rpm => {}
            _ => self.cooldown -= 1,
        }
        None
    }

    fn test(&self, inputs: &CueInputs<'_>) -> Option<ShiftCue> {
        if inputs.sample.throttle.0 < self.config.min_throttle {
            return None;
        }

        let lookahead = inputs.lookahead;
        let tone = inputs.tone_offset;
        let ratio = |target: f64| {
            inputs
                .curve
                .map_or(1.0, |curve| curve.torque_ratio(inputs.rpm, target))
        };

        let mut triggers = Vec::new();
        let mut target_rpm = f64::INFINITY;

        if let Some(shift_rpm) = inputs.shift_rpm {
            if lookahead.test(shift_rpm, tone, ratio(shift_rpm)) {
                triggers.push(CueTrigger::ShiftRpm);
                target_rpm = target_rpm.min(shift_rpm);
            }
        }

        if let Some(revlimit) = inputs.revlimit {
            let near_limit = revlimit * self.config.revlimit_percent;
            if lookahead.test(near_limit, tone, ratio(near_limit)) {
                triggers.push(CueTrigger::RevlimitPercent);
                target_rpm = target_rpm.min(near_limit);
            }

            let lead = tone + self.config.revlimit_offset;
            if lookahead.test(revlimit, lead, ratio(revlimit)) {
                triggers.push(CueTrigger::RevlimitTime);
                if let Some(forecast) = lookahead.forecast(tone) {
                    target_rpm = target_rpm.min(forecast);
                }
            }
        }

        if triggers.is_empty() {
            return None;
        }
        if !target_rpm.is_finite() {
            target_rpm = inputs.revlimit.unwrap_or(inputs.rpm);
        }

        debug!(
            "Cue in gear {} at {:.0} RPM, target {:.0} ({:?})",
            inputs.sample.gear, inputs.rpm, target_rpm, triggers
        );
        Some(ShiftCue {
            index: inputs.sample.index,
            gear: inputs.sample.gear,
            rpm: inputs.rpm,
            target_rpm,
            tone_offset: tone,
            triggers,
        })
    }

    pub fn reset(&mut self) {
        self.cooldown = 0;
    }
}
