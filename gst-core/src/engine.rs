//! Per-sample shift pipeline
//!
//! `ShiftEngine` owns all learned state for the current car and runs each
//! sample through the stages in order: gate, car change, RPM tracking, curve
//! collection, gear tracking, shift detection and cue prediction. A stage
//! that fails logs a warning and the remaining stages still run.

use crate::collector::{is_native, AccelState, CurveCollector, DragState};
use crate::config::ShiftConfig;
use crate::curve::{CurveError, CurveOrigin, EngineCurve, PowerUnit};
use crate::gear::{GearInfo, Gears};
use crate::history::{ShiftHistory, ShiftRecord};
use crate::lookahead::{HysteresisRpm, Lookahead};
use crate::model::Sample;
use crate::predictor::{CueInputs, ShiftCue, ShiftPredictor};
use crate::tone::{Detection, ShiftDetector, ToneOffset, ToneOffsetInfo};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Car ordinals outside `1..=MAX_CAR_ORDINAL` are treated as garbage
pub const MAX_CAR_ORDINAL: i32 = 100_000;

/// Where the current rev limit came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevlimitSource {
    /// Engine max RPM minus a fixed margin, used until a curve exists
    Guess,
    Curve,
}

/// Something that changed while processing a sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    CarChanged {
        car_ordinal: i32,
    },
    CurveUpdated {
        revlimit: f64,
        peak_power_rpm: f64,
        unit: PowerUnit,
        /// `None` when the curve was installed rather than collected
        origin: Option<CurveOrigin>,
    },
    GearLocked {
        gear: usize,
        ratio: f64,
    },
    ShiftRpmCalculated {
        gear: usize,
        shift_rpm: f64,
    },
    ShiftObserved {
        record: ShiftRecord,
    },
    ToneOffsetChanged {
        value: f64,
    },
}

/// Result of processing one sample
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickOutput {
    pub cue: Option<ShiftCue>,
    pub events: Vec<EngineEvent>,
}

/// Condensed view of the current curve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurveSummary {
    pub revlimit: f64,
    pub unit: PowerUnit,
    pub points: usize,
    pub peak_power_rpm: f64,
    pub peak_power: f64,
    pub origin: Option<CurveOrigin>,
}

impl CurveSummary {
    fn of(curve: &EngineCurve) -> Self {
        let (peak_power_rpm, peak_power) = curve.peak_power(2);
        Self {
            revlimit: curve.revlimit(),
            unit: curve.unit(),
            points: curve.rpm().len(),
            peak_power_rpm,
            peak_power,
            origin: curve.origin().cloned(),
        }
    }
}

/// Serializable engine state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub car_ordinal: Option<i32>,
    pub samples_processed: u64,
    pub rpm: f64,
    pub gear: Option<i8>,
    pub revlimit: Option<f64>,
    pub revlimit_source: Option<RevlimitSource>,
    pub collecting: bool,
    pub accel_state: AccelState,
    pub drag_state: DragState,
    pub curve: Option<CurveSummary>,
    pub gears: Vec<GearInfo>,
    pub tone_offset: ToneOffsetInfo,
    pub target_rpm: Option<f64>,
    pub shifts_observed: usize,
    pub last_shift: Option<ShiftRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShiftEngine {
    config: ShiftConfig,
    car_ordinal: Option<i32>,
    samples_processed: u64,
    last_gear: Option<i8>,

    rpm: HysteresisRpm,
    lookahead: Lookahead,

    collecting: bool,
    collector: CurveCollector,
    curve: Option<EngineCurve>,
    revlimit: Option<(f64, RevlimitSource)>,

    gears: Gears,
    detector: ShiftDetector,
    tone: ToneOffset,
    history: ShiftHistory,
    predictor: ShiftPredictor,

    /// Lowest cue target since the last shift
    target_rpm: Option<f64>,
}

impl ShiftEngine {
    pub fn new(config: ShiftConfig) -> Self {
        Self {
            car_ordinal: None,
            samples_processed: 0,
            last_gear: None,
            rpm: HysteresisRpm::new(),
            lookahead: Lookahead::new(&config.lookahead),
            collecting: true,
            collector: CurveCollector::new(
                config.accel.clone(),
                config.drag.clone(),
                config.tick_rate,
            ),
            curve: None,
            revlimit: None,
            gears: Gears::new(config.gears.clone()),
            detector: ShiftDetector::new(),
            tone: ToneOffset::new(config.tone.clone()),
            history: ShiftHistory::new(config.tick_rate),
            predictor: ShiftPredictor::new(config.cue.clone()),
            target_rpm: None,
            config,
        }
    }

    pub fn config(&self) -> &ShiftConfig {
        &self.config
    }

    pub fn curve(&self) -> Option<&EngineCurve> {
        self.curve.as_ref()
    }

    pub fn gears(&self) -> &Gears {
        &self.gears
    }

    pub fn history(&self) -> &ShiftHistory {
        &self.history
    }

    pub fn car_ordinal(&self) -> Option<i32> {
        self.car_ordinal
    }

    pub fn tone_offset(&self) -> f64 {
        self.tone.value()
    }

    pub fn revlimit(&self) -> Option<f64> {
        self.revlimit.map(|(rpm, _)| rpm)
    }

    /// Run one sample through every stage
    pub fn process(&mut self, sample: &Sample) -> TickOutput {
        let mut out = TickOutput::default();
        if !self.passes_gate(sample) {
            return out;
        }
        self.samples_processed += 1;
        let gear_changed = self.last_gear.is_some_and(|g| g != sample.gear);
        self.last_gear = Some(sample.gear);

        self.check_car_change(sample, &mut out.events);
        let rpm = self.track_rpm(sample, gear_changed);

        if let Err(e) = self.collect(sample, &mut out.events) {
            warn!("Curve collection stage failed: {}", e);
        }
        self.track_gears(sample, &mut out.events);
        self.detect_shift(sample, &mut out.events);
        out.cue = self.predict(sample, rpm);

        out
    }

    // === Stages ===

    fn passes_gate(&self, sample: &Sample) -> bool {
        (sample.on_track || self.config.include_replay)
            && !sample.loading
            && !sample.paused
            && sample.rpm().is_finite()
            && sample.forward_gear().is_some()
    }

    fn check_car_change(&mut self, sample: &Sample, events: &mut Vec<EngineEvent>) {
        let ordinal = sample.car_ordinal;
        if ordinal <= 0 || ordinal > MAX_CAR_ORDINAL || self.car_ordinal == Some(ordinal) {
            return;
        }

        info!(
            "Car changed from {:?} to {}, resetting learned state",
            self.car_ordinal, ordinal
        );
        let processed = self.samples_processed;
        self.reset();
        self.samples_processed = processed;
        self.last_gear = Some(sample.gear);
        self.car_ordinal = Some(ordinal);
        events.push(EngineEvent::CarChanged {
            car_ordinal: ordinal,
        });
    }

    /// Hysteresis RPM, fed into the lookahead window for this gear
    fn track_rpm(&mut self, sample: &Sample, gear_changed: bool) -> f64 {
        if gear_changed {
            self.lookahead.clear();
        }
        let rpm = self.rpm.update(sample, self.config.hysteresis_percent);
        self.lookahead.add(rpm);

        if self.revlimit.is_none() && self.config.revlimit_guess > 0.0 {
            let max = sample.engine_max_rpm.as_f64();
            if max > self.config.revlimit_guess {
                let guess = max - self.config.revlimit_guess;
                info!("Rev limit guessed at {:.0} from engine max {:.0}", guess, max);
                self.revlimit = Some((guess, RevlimitSource::Guess));
            }
        }
        rpm
    }

    fn collect(&mut self, sample: &Sample, events: &mut Vec<EngineEvent>) -> Result<(), CurveError> {
        if !self.collecting || !self.collector.update(sample) {
            return Ok(());
        }
        let Some(accel) = self.collector.accel_run() else {
            return Ok(());
        };

        let curve = if is_native(accel) {
            EngineCurve::from_native_run(accel, &self.config.curve)?
        } else if let Some((accel, drag)) = self.collector.runs() {
            EngineCurve::from_runs(accel, drag, &self.config.curve, self.config.tick_rate)?
        } else {
            return Ok(());
        };
        self.apply_curve(curve, events);
        Ok(())
    }

    fn track_gears(&mut self, sample: &Sample, events: &mut Vec<EngineEvent>) {
        let Some(number) = self.gears.update(sample) else {
            return;
        };
        if let Some(ratio) = self.gears.gear(number).and_then(|g| g.ratio()) {
            events.push(EngineEvent::GearLocked {
                gear: number,
                ratio,
            });
        }
        self.calculate_shift_rpms(events);
    }

    fn detect_shift(&mut self, sample: &Sample, events: &mut Vec<EngineEvent>) {
        match self.detector.update(sample, &mut self.tone) {
            Detection::None => {}
            Detection::Downshift => {
                self.target_rpm = None;
            }
            Detection::Upshift {
                from_gear,
                shift_rpm,
                counter,
            } => {
                if let Some(shift_rpm) = shift_rpm {
                    let record = self
                        .history
                        .record(self.target_rpm, shift_rpm, from_gear, counter);
                    events.push(EngineEvent::ShiftObserved { record });
                    if let Some(value) = self.tone.finish_counter() {
                        events.push(EngineEvent::ToneOffsetChanged { value });
                    }
                } else {
                    debug!("Upshift out of gear {} without a shift point", from_gear);
                }
                self.tone.reset_counter();
                self.target_rpm = None;
            }
        }
    }

    fn predict(&mut self, sample: &Sample, rpm: f64) -> Option<ShiftCue> {
        let inputs = CueInputs {
            sample,
            rpm,
            lookahead: &self.lookahead,
            curve: self.curve.as_ref(),
            shift_rpm: self.gears.shift_rpm_of(sample.gear),
            revlimit: self.revlimit.map(|(rpm, _)| rpm),
            tone_offset: self.tone.value(),
            is_highest: self.gears.is_highest(sample.gear),
        };
        let cue = self.predictor.evaluate(inputs)?;

        self.tone.start_counter();
        self.target_rpm = Some(self.target_rpm.map_or(cue.target_rpm, |t| t.min(cue.target_rpm)));
        Some(cue)
    }

    // === Curve handling ===

    fn apply_curve(&mut self, curve: EngineCurve, events: &mut Vec<EngineEvent>) {
        let summary = CurveSummary::of(&curve);
        info!(
            "Engine curve updated: rev limit {:.0}, peak power at {:.0} RPM",
            summary.revlimit, summary.peak_power_rpm
        );

        self.revlimit = Some((curve.revlimit(), RevlimitSource::Curve));
        self.curve = Some(curve);
        self.gears.regress_all();
        events.push(EngineEvent::CurveUpdated {
            revlimit: summary.revlimit,
            peak_power_rpm: summary.peak_power_rpm,
            unit: summary.unit,
            origin: summary.origin,
        });
        self.calculate_shift_rpms(events);
    }

    fn calculate_shift_rpms(&mut self, events: &mut Vec<EngineEvent>) {
        let Some(curve) = self.curve.as_ref() else {
            return;
        };
        for gear in self.gears.calculate_shift_rpms(curve) {
            if let Some(shift_rpm) = self.gears.gear(gear).and_then(|g| g.shift_rpm()) {
                events.push(EngineEvent::ShiftRpmCalculated { gear, shift_rpm });
            }
        }
    }

    /// Use a stored curve; collection stops until the next reset
    pub fn install_curve(&mut self, curve: EngineCurve) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        self.collecting = false;
        self.collector.reset();
        self.apply_curve(curve, &mut events);
        events
    }

    // === Control ===

    /// Set the tone offset by hand; returns the clamped value
    pub fn set_tone_offset(&mut self, value: f64) -> f64 {
        let value = self.tone.set_manual(value);
        info!("Tone offset set to {:.1}", value);
        value
    }

    /// Forget everything learned for the current car
    ///
    /// The learned tone offset is kept, it belongs to the player.
    pub fn reset(&mut self) {
        self.car_ordinal = None;
        self.samples_processed = 0;
        self.last_gear = None;
        self.rpm.reset();
        self.lookahead.clear();
        self.collecting = true;
        self.collector.reset();
        self.curve = None;
        self.revlimit = None;
        self.gears.reset();
        self.detector.clear();
        self.tone.reset_counter();
        self.history.reset();
        self.predictor.reset();
        self.target_rpm = None;
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            car_ordinal: self.car_ordinal,
            samples_processed: self.samples_processed,
            rpm: self.rpm.value(),
            gear: self.last_gear,
            revlimit: self.revlimit.map(|(rpm, _)| rpm),
            revlimit_source: self.revlimit.map(|(_, source)| source),
            collecting: self.collecting,
            accel_state: self.collector.accel_state(),
            drag_state: self.collector.drag_state(),
            curve: self.curve.as_ref().map(CurveSummary::of),
            gears: self.gears.info(),
            tone_offset: self.tone.info(),
            target_rpm: self.target_rpm,
            shifts_observed: self.history.len(),
            last_shift: self.history.last().cloned(),
        }
    }
}
