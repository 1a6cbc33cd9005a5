//! Run collectors
//!
//! Recognize full-throttle acceleration runs and clutch-out coasting runs in
//! the live sample stream. Collectors never fail: a sample that does not fit
//! the current pattern either leaves the state alone or resets it.

use crate::config::{AccelConfig, DragConfig};
use crate::model::Sample;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Common interface of the run collectors
pub trait RunCollector {
    /// Feed one sample
    fn update(&mut self, sample: &Sample);

    /// Whether a complete run is available
    fn is_completed(&self) -> bool;

    /// Samples collected so far, oldest first
    fn run(&self) -> &[Sample];

    /// Return to the freshly constructed state
    fn reset(&mut self);
}

// === Acceleration runs ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccelState {
    Wait,
    Running,
    MaybeAtRevLimit,
    Testing,
    Done,
}

/// Collects consecutive full-throttle samples until the rev limiter is confirmed
///
/// The limiter is confirmed by `revlimit_bounce` consecutive samples at or
/// below the peak RPM of the run.
#[derive(Debug, Clone, PartialEq)]
pub struct AccelCollector {
    config: AccelConfig,
    state: AccelState,
    run: Vec<Sample>,
    prev_rpm: Option<f64>,
    peak_rpm: Option<f64>,
    gear: Option<i8>,
    bounce: usize,
}

impl AccelCollector {
    pub fn new(config: AccelConfig) -> Self {
        Self {
            config,
            state: AccelState::Wait,
            run: Vec::new(),
            prev_rpm: None,
            peak_rpm: None,
            gear: None,
            bounce: 0,
        }
    }

    pub fn state(&self) -> AccelState {
        self.state
    }

    /// Gear the current run started in
    pub fn gear(&self) -> Option<i8> {
        self.gear
    }

    /// RPM of the final sample once the run is done
    pub fn revlimit_if_done(&self) -> Option<f64> {
        if self.state != AccelState::Done {
            return None;
        }
        self.run.last().map(Sample::rpm)
    }
}

impl RunCollector for AccelCollector {
    fn update(&mut self, sample: &Sample) {
        let rpm = sample.rpm();
        let rising = self.prev_rpm.map_or(true, |prev| prev < rpm);

        if self.state == AccelState::Wait
            && sample.throttle.is_full()
            && sample.on_track
            && rising
        {
            self.state = AccelState::Running;
            self.gear = Some(sample.gear);
            debug!("Collecting accel run in gear {}", sample.gear);
        }

        if self.state == AccelState::Running {
            if !sample.throttle.is_full() {
                self.reset();
            } else if self.prev_rpm.is_some_and(|prev| rpm < prev) {
                self.state = AccelState::MaybeAtRevLimit;
            } else {
                self.run.push(sample.clone());
            }
        }

        if self.state == AccelState::MaybeAtRevLimit {
            if !sample.throttle.is_full() || self.gear != Some(sample.gear) {
                debug!("Accel run abandoned near rev limit");
                self.reset();
            } else if self.peak_rpm.is_some_and(|peak| rpm <= peak) {
                self.bounce += 1;
                self.run.push(sample.clone());
            } else {
                self.state = AccelState::Running;
                self.bounce = 0;
                self.run.push(sample.clone());
            }

            if self.bounce >= self.config.revlimit_bounce {
                self.state = AccelState::Testing;
                if !self.config.keep_overflow {
                    let keep = self.run.len().saturating_sub(self.config.revlimit_bounce);
                    self.run.truncate(keep);
                }
            }
        }

        if self.state == AccelState::Testing {
            let peak = self.peak_rpm.unwrap_or(rpm);
            if self.run.len() < self.config.min_len {
                debug!(
                    "Accel run rejected: {} samples, need {}",
                    self.run.len(),
                    self.config.min_len
                );
                self.reset();
            } else if peak < sample.upshift_rpm.as_f64() {
                debug!(
                    "Accel run rejected: peak {:.0} below upshift RPM {:.0}",
                    peak,
                    sample.upshift_rpm.as_f64()
                );
                self.reset();
            } else {
                self.state = AccelState::Done;
                info!("Accel run done, peak at {:.0} RPM", peak);
            }
        }

        self.prev_rpm = Some(rpm);
        if self.state != AccelState::Wait {
            self.peak_rpm = Some(self.peak_rpm.map_or(rpm, |peak| peak.max(rpm)));
        }
    }

    fn is_completed(&self) -> bool {
        self.state == AccelState::Done
    }

    fn run(&self) -> &[Sample] {
        &self.run
    }

    fn reset(&mut self) {
        *self = Self::new(self.config.clone());
    }
}

// === Coasting runs ===

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DragState {
    Wait,
    Running,
    Testing,
    Done,
}

/// Collects samples while the car coasts with the clutch disengaged
///
/// The deceleration during such a run is caused by aerodynamic and rolling
/// drag only, which is what the curve builder subtracts from the accel run.
#[derive(Debug, Clone, PartialEq)]
pub struct DragCollector {
    config: DragConfig,
    tick_rate: f64,
    state: DragState,
    run: Vec<Sample>,
    prev_rpm: Option<f64>,
    gear: Option<i8>,
}

impl DragCollector {
    pub fn new(config: DragConfig, tick_rate: f64) -> Self {
        Self {
            config,
            tick_rate,
            state: DragState::Wait,
            run: Vec::new(),
            prev_rpm: None,
            gear: None,
        }
    }

    pub fn state(&self) -> DragState {
        self.state
    }

    pub fn gear(&self) -> Option<i8> {
        self.gear
    }

    /// Seconds spanned by the collected samples, based on their indices
    pub fn duration_secs(&self) -> f64 {
        match (self.run.first(), self.run.last()) {
            (Some(first), Some(last)) => {
                (last.index.saturating_sub(first.index) + 1) as f64 / self.tick_rate
            }
            _ => 0.0,
        }
    }
}

impl RunCollector for DragCollector {
    fn update(&mut self, sample: &Sample) {
        let rpm = sample.rpm();

        if self.state == DragState::Wait
            && sample.clutch_disengaged()
            && self.prev_rpm.is_some_and(|prev| prev > rpm)
            && sample.throttle.is_zero()
            && sample.brake.is_zero()
            && !sample.handbrake
        {
            self.state = DragState::Running;
            self.gear = Some(sample.gear);
            debug!("Collecting drag run");
        }

        if self.state == DragState::Running {
            if sample.handbrake || !sample.brake.is_zero() {
                debug!("Drag run reset by brake or handbrake");
                self.reset();
            } else if !sample.clutch_disengaged() || sample.throttle.0 > self.config.throttle_release {
                self.state = DragState::Testing;
            } else {
                self.run.push(sample.clone());
            }
        }

        if self.state == DragState::Testing {
            let duration = self.duration_secs();
            if duration < self.config.min_duration_secs {
                debug!(
                    "Drag run rejected: {:.1}s, need {:.1}s",
                    duration, self.config.min_duration_secs
                );
                self.reset();
            } else {
                self.state = DragState::Done;
                info!("Drag run done, {:.1}s of coasting", duration);
            }
        }

        self.prev_rpm = Some(rpm);
    }

    fn is_completed(&self) -> bool {
        self.state == DragState::Done
    }

    fn run(&self) -> &[Sample] {
        &self.run
    }

    fn reset(&mut self) {
        *self = Self::new(self.config.clone(), self.tick_rate);
    }
}

// === Paired collection ===

/// Whether every sample carries native torque and power
pub fn is_native(run: &[Sample]) -> bool {
    !run.is_empty() && run.iter().all(|s| s.torque.is_some() && s.power.is_some())
}

/// Whether `new` should replace the `current` accel run
///
/// A replacement must reach at least as high or start at least as low, in a
/// gear no lower, with no fewer samples.
pub fn is_better_run(new: &[Sample], current: &[Sample]) -> bool {
    let (Some(new_first), Some(new_last)) = (new.first(), new.last()) else {
        return false;
    };
    let (Some(cur_first), Some(cur_last)) = (current.first(), current.last()) else {
        return true;
    };

    (new_last.rpm() >= cur_last.rpm() || new_first.rpm() <= cur_first.rpm())
        && new_first.gear >= cur_first.gear
        && new.len() >= current.len()
}

/// Feeds both collectors and holds the runs a curve is built from
///
/// Keeps the best accel run seen and the first drag run.
#[derive(Debug, Clone, PartialEq)]
pub struct CurveCollector {
    accel: AccelCollector,
    drag: DragCollector,
    accel_run: Option<Vec<Sample>>,
    drag_run: Option<Vec<Sample>>,
}

impl CurveCollector {
    pub fn new(accel: AccelConfig, drag: DragConfig, tick_rate: f64) -> Self {
        Self {
            accel: AccelCollector::new(accel),
            drag: DragCollector::new(drag, tick_rate),
            accel_run: None,
            drag_run: None,
        }
    }

    /// Feed one sample; true when a curve can be built from new data
    ///
    /// That is a new or better pair of runs, or a new accel run that carries
    /// native torque and needs no coasting run.
    pub fn update(&mut self, sample: &Sample) -> bool {
        let mut changed = false;

        self.accel.update(sample);
        if self.accel.is_completed() {
            let candidate = self.accel.run().to_vec();
            let better = match &self.accel_run {
                Some(current) => is_better_run(&candidate, current),
                None => true,
            };
            if better {
                info!(
                    "Accel run accepted: {} samples in gear {}",
                    candidate.len(),
                    self.accel.gear().unwrap_or_default()
                );
                self.accel_run = Some(candidate);
                changed = true;
            }
            self.accel.reset();
        }

        self.drag.update(sample);
        if self.drag.is_completed() && self.drag_run.is_none() {
            info!("Drag run accepted: {} samples", self.drag.run().len());
            self.drag_run = Some(self.drag.run().to_vec());
            changed = true;
        }

        changed && (self.is_ready() || self.accel_run().is_some_and(is_native))
    }

    /// Both an accel run and a drag run are held
    pub fn is_ready(&self) -> bool {
        self.accel_run.is_some() && self.drag_run.is_some()
    }

    pub fn accel_run(&self) -> Option<&[Sample]> {
        self.accel_run.as_deref()
    }

    /// The accel and drag runs, once both exist
    pub fn runs(&self) -> Option<(&[Sample], &[Sample])> {
        match (&self.accel_run, &self.drag_run) {
            (Some(accel), Some(drag)) => Some((accel.as_slice(), drag.as_slice())),
            _ => None,
        }
    }

    pub fn accel_state(&self) -> AccelState {
        self.accel.state()
    }

    pub fn drag_state(&self) -> DragState {
        self.drag.state()
    }

    pub fn reset(&mut self) {
        self.accel.reset();
        self.drag.reset();
        self.accel_run = None;
        self.drag_run = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::{Percentage, Rpm};

    fn accel_sample(index: u64, rpm: f32) -> Sample {
        Sample {
            index,
            rpm: Rpm(rpm),
            upshift_rpm: Rpm(6500.0),
            gear: 3,
            in_gear: true,
            throttle: Percentage::FULL,
            on_track: true,
            ..Default::default()
        }
    }

    fn coast_sample(index: u64, rpm: f32) -> Sample {
        Sample {
            index,
            rpm: Rpm(rpm),
            gear: 4,
            clutch: Percentage::FULL,
            on_track: true,
            ..Default::default()
        }
    }

    /// Rising RPM from `start` to `peak` in `step` increments, then limiter bounce
    fn accel_trace(start: f32, peak: f32, step: f32, bounce: usize) -> Vec<Sample> {
        let mut samples = Vec::new();
        let mut rpm = start;
        let mut index = 0;
        while rpm <= peak {
            samples.push(accel_sample(index, rpm));
            rpm += step;
            index += 1;
        }
        for i in 0..bounce {
            let dip = if i % 2 == 0 { 60.0 } else { 20.0 };
            samples.push(accel_sample(index, peak - dip));
            index += 1;
        }
        samples
    }

    #[test]
    fn test_accel_run_completes_at_rev_limit() {
        let mut collector = AccelCollector::new(AccelConfig::default());
        for sample in accel_trace(3000.0, 7000.0, 40.0, 15) {
            collector.update(&sample);
        }

        assert!(collector.is_completed());
        assert_eq!(collector.run().len(), 101);
        assert_eq!(collector.revlimit_if_done(), Some(7000.0));
    }

    #[test]
    fn test_accel_keep_overflow_retains_bounce() {
        let config = AccelConfig {
            keep_overflow: true,
            ..Default::default()
        };
        let mut collector = AccelCollector::new(config);
        for sample in accel_trace(3000.0, 7000.0, 40.0, 15) {
            collector.update(&sample);
        }

        assert!(collector.is_completed());
        assert_eq!(collector.run().len(), 116);
    }

    #[test]
    fn test_accel_run_too_short_is_rejected() {
        let mut collector = AccelCollector::new(AccelConfig::default());
        for sample in accel_trace(5000.0, 7000.0, 40.0, 15) {
            collector.update(&sample);
        }

        assert!(!collector.is_completed());
        assert_eq!(collector.state(), AccelState::Wait);
        assert!(collector.run().is_empty());
    }

    #[test]
    fn test_accel_peak_below_upshift_is_rejected() {
        let mut collector = AccelCollector::new(AccelConfig::default());
        for sample in accel_trace(2000.0, 6000.0, 40.0, 15) {
            collector.update(&sample);
        }

        assert!(!collector.is_completed());
        assert_eq!(collector.revlimit_if_done(), None);
    }

    #[test]
    fn test_accel_throttle_lift_resets() {
        let mut collector = AccelCollector::new(AccelConfig::default());
        for sample in accel_trace(3000.0, 5000.0, 40.0, 0) {
            collector.update(&sample);
        }
        assert_eq!(collector.state(), AccelState::Running);

        let mut lifted = accel_sample(100, 5000.0);
        lifted.throttle = Percentage::new(0.5);
        collector.update(&lifted);

        assert_eq!(collector.state(), AccelState::Wait);
        assert!(collector.run().is_empty());
    }

    #[test]
    fn test_accel_gear_change_near_limit_resets() {
        let mut collector = AccelCollector::new(AccelConfig::default());
        for sample in accel_trace(3000.0, 7000.0, 40.0, 3) {
            collector.update(&sample);
        }
        assert_eq!(collector.state(), AccelState::MaybeAtRevLimit);

        let mut shifted = accel_sample(200, 5200.0);
        shifted.gear = 4;
        collector.update(&shifted);

        assert_eq!(collector.state(), AccelState::Wait);
    }

    #[test]
    fn test_accel_reset_equals_fresh() {
        let config = AccelConfig::default();
        let mut collector = AccelCollector::new(config.clone());
        for sample in accel_trace(3000.0, 7000.0, 40.0, 15) {
            collector.update(&sample);
        }
        collector.reset();

        assert_eq!(collector, AccelCollector::new(config));
    }

    #[test]
    fn test_drag_run_completes_after_min_duration() {
        let mut collector = DragCollector::new(DragConfig::default(), 60.0);
        for i in 0..400 {
            collector.update(&coast_sample(i, 6000.0 - i as f32 * 5.0));
        }
        let mut engaged = coast_sample(400, 4000.0);
        engaged.clutch = Percentage::ZERO;
        collector.update(&engaged);

        assert!(collector.is_completed());
        // The first sample only seeds the previous RPM
        assert_eq!(collector.run().len(), 399);
    }

    #[test]
    fn test_drag_run_too_short_is_rejected() {
        let mut collector = DragCollector::new(DragConfig::default(), 60.0);
        for i in 0..100 {
            collector.update(&coast_sample(i, 6000.0 - i as f32 * 5.0));
        }
        let mut throttle = coast_sample(100, 5500.0);
        throttle.throttle = Percentage::new(0.5);
        collector.update(&throttle);

        assert!(!collector.is_completed());
        assert_eq!(collector.state(), DragState::Wait);
    }

    #[test]
    fn test_drag_brake_resets() {
        let mut collector = DragCollector::new(DragConfig::default(), 60.0);
        for i in 0..50 {
            collector.update(&coast_sample(i, 6000.0 - i as f32 * 5.0));
        }
        assert_eq!(collector.state(), DragState::Running);

        let mut braking = coast_sample(50, 5700.0);
        braking.brake = Percentage::new(0.3);
        collector.update(&braking);

        assert_eq!(collector.state(), DragState::Wait);
        assert!(collector.run().is_empty());
    }

    #[test]
    fn test_drag_reset_equals_fresh() {
        let mut collector = DragCollector::new(DragConfig::default(), 60.0);
        for i in 0..50 {
            collector.update(&coast_sample(i, 6000.0 - i as f32 * 5.0));
        }
        collector.reset();

        assert_eq!(collector, DragCollector::new(DragConfig::default(), 60.0));
    }

    #[test]
    fn test_better_run_policy() {
        let current = accel_trace(3000.0, 7000.0, 40.0, 0);

        let higher = accel_trace(3000.0, 7100.0, 40.0, 0);
        assert!(is_better_run(&higher, &current));

        let lower_start = accel_trace(2960.0, 6960.0, 40.0, 0);
        assert!(is_better_run(&lower_start, &current));

        let shorter = accel_trace(3000.0, 7000.0, 80.0, 0);
        assert!(!is_better_run(&shorter, &current));

        let mut lower_gear = higher.clone();
        for sample in &mut lower_gear {
            sample.gear = 2;
        }
        assert!(!is_better_run(&lower_gear, &current));

        assert!(is_better_run(&current, &[]));
        assert!(!is_better_run(&[], &current));
    }

    #[test]
    fn test_curve_collector_native_needs_no_drag() {
        let mut collector = CurveCollector::new(AccelConfig::default(), DragConfig::default(), 60.0);
        let mut ready = false;
        for mut sample in accel_trace(3000.0, 7000.0, 40.0, 15) {
            sample.torque = Some(crate::units::NewtonMeters(400.0));
            sample.power = Some(crate::units::Watts(200_000.0));
            ready |= collector.update(&sample);
        }

        assert!(ready);
        assert!(collector.runs().is_none());
        assert!(collector.accel_run().is_some_and(is_native));
    }

    #[test]
    fn test_curve_collector_reports_pair() {
        let mut collector = CurveCollector::new(AccelConfig::default(), DragConfig::default(), 60.0);

        let mut ready = false;
        for sample in accel_trace(3000.0, 7000.0, 40.0, 15) {
            ready |= collector.update(&sample);
        }
        assert!(!ready);
        assert!(!collector.is_ready());

        for i in 0..400 {
            ready |= collector.update(&coast_sample(1000 + i, 6000.0 - i as f32 * 5.0));
        }
        let mut engaged = coast_sample(1400, 4000.0);
        engaged.clutch = Percentage::ZERO;
        ready |= collector.update(&engaged);

        assert!(ready);
        let (accel, drag) = collector.runs().unwrap();
        assert_eq!(accel.len(), 101);
        // Coasting starts right after the limiter bounce, so every coast sample counts
        assert_eq!(drag.len(), 400);
        assert_eq!(collector.accel_state(), AccelState::Wait);
    }
}
