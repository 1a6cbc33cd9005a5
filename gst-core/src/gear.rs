//! Per-gear ratio tracking and shift RPM calculation
//!
//! With the clutch engaged, engine speed and driven wheel speed are locked
//! together by the gear ratio (including the final drive). Each gear collects
//! derived ratios until they settle, then locks. Once two neighbouring gears
//! are locked and a power curve exists, the optimal shift RPM between them
//! follows from where the power curve crosses itself scaled by the relative
//! ratio.

use crate::config::GearConfig;
use crate::curve::{segment_intersection, EngineCurve};
use crate::model::{Sample, MAX_GEARS};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::f64::consts::TAU;
use thiserror::Error;
use tracing::{info, warn};

/// Lifecycle of a gear, ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GearState {
    /// Not seen yet
    #[default]
    Unused,
    /// Seen, ratio not yet stable
    Reached,
    /// Ratio stable and trusted
    Locked,
    /// Shift RPM derived from the ratio and the power curve
    Calculated,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal gear state transition {from:?} -> {to:?}")]
pub struct GearStateError {
    pub from: GearState,
    pub to: GearState,
}

impl GearState {
    /// Move one step forward
    pub fn advance(self) -> Result<Self, GearStateError> {
        let to = match self {
            GearState::Unused => GearState::Reached,
            GearState::Reached => GearState::Locked,
            GearState::Locked => GearState::Calculated,
            GearState::Calculated => {
                return Err(GearStateError {
                    from: self,
                    to: GearState::Calculated,
                })
            }
        };
        Ok(to)
    }

    /// The only backward transition: Calculated -> Locked
    pub fn regress(self) -> Result<Self, GearStateError> {
        match self {
            GearState::Calculated => Ok(GearState::Locked),
            from => Err(GearStateError {
                from,
                to: GearState::Locked,
            }),
        }
    }

    pub fn at_least_locked(self) -> bool {
        self >= GearState::Locked
    }
}

/// Drivetrain ratio (engine revolutions per driven wheel revolution)
///
/// Returns `None` for samples that cannot yield a trustworthy ratio: below
/// `min_speed`, engine stopped, or wheels not turning.
pub fn derive_gear_ratio(sample: &Sample, min_speed: f32) -> Option<f64> {
    let rpm = sample.rpm();
    if sample.speed.0.abs() < min_speed || rpm == 0.0 {
        return None;
    }

    let rad = sample.wheel_speeds.driven_average(sample.drivetrain).abs();
    if rad <= 1e-6 {
        return None;
    }
    Some(TAU * rpm / (rad * 60.0))
}

/// RPM where `power` equals `power` at `rpm / relative_ratio`
///
/// Intersects the curve with a copy stretched along RPM by the relative
/// ratio. The last intersection wins; without one the rev limit is used.
/// The flag reports more than one intersection, which means a noisy curve.
pub fn calculate_shift_rpm(rpm: &[f64], power: &[f64], relative_ratio: f64) -> (f64, bool) {
    let revlimit = rpm.last().copied().unwrap_or_default();
    let scaled: Vec<f64> = rpm.iter().map(|r| r * relative_ratio).collect();

    let mut intersections: Vec<f64> = Vec::new();
    for i in 0..rpm.len().saturating_sub(1) {
        for j in 0..scaled.len().saturating_sub(1) {
            if scaled[j] > rpm[i + 1] || scaled[j + 1] < rpm[i] {
                continue;
            }
            if let Some((x, _)) = segment_intersection(
                (rpm[i], power[i]),
                (rpm[i + 1], power[i + 1]),
                (scaled[j], power[j]),
                (scaled[j + 1], power[j + 1]),
            ) {
                // A crossing on a shared vertex shows up in both segments
                if !intersections.iter().any(|&seen| (seen - x).abs() < 1e-6) {
                    intersections.push(x);
                }
            }
        }
    }

    let noisy = intersections.len() > 1;
    let shift_rpm = intersections
        .into_iter()
        .reduce(f64::max)
        .map_or(revlimit, f64::round);
    (shift_rpm, noisy)
}

/// Sample variance (n - 1 denominator)
fn variance(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// One forward gear
#[derive(Debug, Clone, PartialEq)]
pub struct Gear {
    number: usize,
    state: GearState,
    window: VecDeque<f64>,
    ratio: Option<f64>,
    variance: Option<f64>,
    relative_ratio: Option<f64>,
    shift_rpm: Option<f64>,
    noisy: bool,
}

/// Serializable view of a gear
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GearInfo {
    pub number: usize,
    pub state: GearState,
    pub ratio: Option<f64>,
    pub variance: Option<f64>,
    pub relative_ratio: Option<f64>,
    pub shift_rpm: Option<f64>,
    pub noisy: bool,
}

impl Gear {
    pub fn new(number: usize) -> Self {
        Self {
            number,
            state: GearState::Unused,
            window: VecDeque::new(),
            ratio: None,
            variance: None,
            relative_ratio: None,
            shift_rpm: None,
            noisy: false,
        }
    }

    pub fn number(&self) -> usize {
        self.number
    }

    pub fn state(&self) -> GearState {
        self.state
    }

    pub fn ratio(&self) -> Option<f64> {
        self.ratio
    }

    pub fn shift_rpm(&self) -> Option<f64> {
        self.shift_rpm
    }

    pub fn relative_ratio(&self) -> Option<f64> {
        self.relative_ratio
    }

    /// Ratio over `next`, once both are locked and this one is lower
    fn relative_to(&self, next: &Gear) -> Option<f64> {
        if !self.state.at_least_locked() || !next.state.at_least_locked() {
            return None;
        }
        let relative = self.ratio? / next.ratio?;
        (relative > 1.0 && relative.is_finite()).then_some(relative)
    }

    /// Feed a sample taken in this gear; true when the gear locked just now
    pub fn update(&mut self, sample: &Sample, config: &GearConfig) -> Result<bool, GearStateError> {
        if self.state == GearState::Unused {
            self.state = self.state.advance()?;
        }
        if self.state.at_least_locked() || !sample.clutch_engaged() {
            return Ok(false);
        }
        let Some(ratio) = derive_gear_ratio(sample, config.min_speed) else {
            return Ok(false);
        };

        self.window.push_back(ratio);
        while self.window.len() > config.window_len {
            self.window.pop_front();
        }
        if self.window.len() < config.min_fill.max(2) {
            return Ok(false);
        }

        let values = self.window.make_contiguous();
        let median = median(values);
        let variance = variance(values);
        self.ratio = Some(median);
        self.variance = Some(variance);

        let bound = config.variance_bounds.for_drivetrain(sample.drivetrain);
        if variance < bound && self.window.len() >= config.lock_samples {
            self.state = self.state.advance()?;
            info!("Gear {} locked at ratio {:.3}", self.number, median);
            return Ok(true);
        }
        Ok(false)
    }

    /// Derive the shift RPM into `next`; true when it was calculated just now
    pub fn calculate_shift_rpm(
        &mut self,
        curve: &EngineCurve,
        next: &Gear,
    ) -> Result<bool, GearStateError> {
        if self.state != GearState::Locked || !next.state.at_least_locked() {
            return Ok(false);
        }
        let (Some(ratio), Some(next_ratio)) = (self.ratio, next.ratio) else {
            return Ok(false);
        };
        let relative_ratio = ratio / next_ratio;
        if !(relative_ratio > 1.0 && relative_ratio.is_finite()) {
            warn!(
                "Gear {} ratio {:.3} not above gear {} ratio {:.3}",
                self.number, ratio, next.number, next_ratio
            );
            return Ok(false);
        }

        let (shift_rpm, noisy) = calculate_shift_rpm(curve.rpm(), curve.power(), relative_ratio);
        if noisy {
            warn!("Gear {}: multiple intersections found, curve may be noisy", self.number);
        }
        info!(
            "Gear {}-{}: shift at {:.0} RPM, drops to {:.0}",
            self.number,
            next.number,
            shift_rpm,
            shift_rpm / relative_ratio
        );

        self.relative_ratio = Some(relative_ratio);
        self.shift_rpm = Some(shift_rpm);
        self.noisy = noisy;
        self.state = self.state.advance()?;
        Ok(true)
    }

    /// Calculated -> Locked, so a better curve recalculates the shift RPM
    pub fn regress(&mut self) {
        if let Ok(state) = self.state.regress() {
            self.state = state;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.number);
    }

    pub fn info(&self) -> GearInfo {
        GearInfo {
            number: self.number,
            state: self.state,
            ratio: self.ratio,
            variance: self.variance,
            relative_ratio: self.relative_ratio,
            shift_rpm: self.shift_rpm,
            noisy: self.noisy,
        }
    }
}

/// Gears 1 through `MAX_GEARS`
#[derive(Debug, Clone, PartialEq)]
pub struct Gears {
    config: GearConfig,
    gears: Vec<Gear>,
    highest: Option<usize>,
}

impl Gears {
    pub fn new(config: GearConfig) -> Self {
        Self {
            config,
            gears: (1..=MAX_GEARS).map(Gear::new).collect(),
            highest: None,
        }
    }

    pub fn gear(&self, number: usize) -> Option<&Gear> {
        number.checked_sub(1).and_then(|i| self.gears.get(i))
    }

    /// Feed a sample to its gear; returns the gear number if it locked
    pub fn update(&mut self, sample: &Sample) -> Option<usize> {
        if let Some(count) = sample.gear_count.filter(|&c| c > 0) {
            let count = (count as usize).min(MAX_GEARS);
            if self.highest != Some(count) {
                info!("Highest gear: {}", count);
                self.highest = Some(count);
            }
        }

        let number = sample.forward_gear()?;
        match self.gears[number - 1].update(sample, &self.config) {
            Ok(true) => {
                self.update_relative_ratios();
                Some(number)
            }
            Ok(false) => None,
            Err(e) => {
                warn!("Gear {} update failed: {}", number, e);
                None
            }
        }
    }

    fn update_relative_ratios(&mut self) {
        for i in 0..self.gears.len() - 1 {
            let relative = self.gears[i].relative_to(&self.gears[i + 1]);
            self.gears[i].relative_ratio = relative;
        }
    }

    /// Calculate shift RPMs for every locked pair; returns the gears updated
    pub fn calculate_shift_rpms(&mut self, curve: &EngineCurve) -> Vec<usize> {
        let mut calculated = Vec::new();
        for i in 0..self.gears.len() - 1 {
            let (low, high) = self.gears.split_at_mut(i + 1);
            let gear = &mut low[i];
            match gear.calculate_shift_rpm(curve, &high[0]) {
                Ok(true) => calculated.push(gear.number),
                Ok(false) => {}
                Err(e) => warn!("Gear {} shift RPM failed: {}", gear.number, e),
            }
        }
        calculated
    }

    /// Return every calculated gear to Locked
    pub fn regress_all(&mut self) {
        self.gears.iter_mut().for_each(Gear::regress);
    }

    pub fn shift_rpm_of(&self, gear: i8) -> Option<f64> {
        usize::try_from(gear)
            .ok()
            .and_then(|g| self.gear(g))
            .and_then(Gear::shift_rpm)
    }

    /// Whether `gear` is the top gear reported by the source
    pub fn is_highest(&self, gear: i8) -> bool {
        usize::try_from(gear).ok().is_some_and(|g| self.highest == Some(g))
    }

    pub fn info(&self) -> Vec<GearInfo> {
        self.gears.iter().map(Gear::info).collect()
    }

    pub fn reset(&mut self) {
        self.gears.iter_mut().for_each(Gear::reset);
        self.highest = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::PowerUnit;
    use crate::model::{Drivetrain, WheelSpeeds};
    use crate::units::{MetersPerSecond, RadiansPerSecond, Rpm};

    /// Sample in `gear` whose rear wheels turn at the speed implied by `ratio`
    fn geared_sample(gear: i8, rpm: f64, ratio: f64) -> Sample {
        let rad = TAU * rpm / (ratio * 60.0);
        Sample {
            rpm: Rpm(rpm as f32),
            gear,
            in_gear: true,
            speed: MetersPerSecond(30.0),
            wheel_speeds: WheelSpeeds::uniform(RadiansPerSecond(rad as f32)),
            drivetrain: Drivetrain::Rwd,
            on_track: true,
            ..Default::default()
        }
    }

    /// Power parabola peaking at 6000 RPM, sampled every 100 RPM up to 7000
    fn parabola_curve() -> EngineCurve {
        let rpm: Vec<f64> = (30..=70).map(|i| i as f64 * 100.0).collect();
        let power: Vec<f64> = rpm.iter().map(|x| 2.0e7 - (x - 6000.0).powi(2)).collect();
        let torque: Vec<f64> = rpm.iter().zip(&power).map(|(r, p)| p / r).collect();
        EngineCurve::from_points(rpm, torque, power, PowerUnit::Absolute).unwrap()
    }

    #[test]
    fn test_state_transitions() {
        assert_eq!(GearState::Unused.advance(), Ok(GearState::Reached));
        assert_eq!(GearState::Locked.advance(), Ok(GearState::Calculated));
        assert!(GearState::Calculated.advance().is_err());

        assert_eq!(GearState::Calculated.regress(), Ok(GearState::Locked));
        assert!(GearState::Reached.regress().is_err());
        assert!(GearState::Locked > GearState::Reached);
    }

    #[test]
    fn test_derive_gear_ratio() {
        let sample = geared_sample(3, 6000.0, 2.5);
        let ratio = derive_gear_ratio(&sample, 3.0).unwrap();
        assert!((ratio - 2.5).abs() < 1e-4);

        let mut slow = sample.clone();
        slow.speed = MetersPerSecond(2.0);
        assert_eq!(derive_gear_ratio(&slow, 3.0), None);

        let mut stalled = sample.clone();
        stalled.rpm = Rpm(0.0);
        assert_eq!(derive_gear_ratio(&stalled, 3.0), None);

        let mut reverse = sample.clone();
        reverse.wheel_speeds = WheelSpeeds::uniform(RadiansPerSecond(-sample.wheel_speeds.rear_left.0));
        assert!((derive_gear_ratio(&reverse, 3.0).unwrap() - 2.5).abs() < 1e-4);

        let mut front = sample.clone();
        front.drivetrain = Drivetrain::Fwd;
        front.wheel_speeds.front_left = RadiansPerSecond(0.0);
        front.wheel_speeds.front_right = RadiansPerSecond(0.0);
        assert_eq!(derive_gear_ratio(&front, 3.0), None);
    }

    #[test]
    fn test_constant_ratio_locks_at_lock_samples() {
        let config = GearConfig::default();
        let mut gear = Gear::new(2);

        for i in 0..config.lock_samples - 1 {
            let locked = gear
                .update(&geared_sample(2, 4000.0 + i as f64 * 50.0, 2.5), &config)
                .unwrap();
            assert!(!locked);
        }
        assert_eq!(gear.state(), GearState::Reached);

        let locked = gear.update(&geared_sample(2, 6000.0, 2.5), &config).unwrap();
        assert!(locked);
        assert_eq!(gear.state(), GearState::Locked);
        assert!((gear.ratio().unwrap() - 2.5).abs() < 1e-3);
    }

    #[test]
    fn test_noisy_ratio_does_not_lock() {
        let config = GearConfig::default();
        let mut gear = Gear::new(2);
        for i in 0..100 {
            let ratio = if i % 2 == 0 { 2.4 } else { 2.6 };
            gear.update(&geared_sample(2, 5000.0, ratio), &config).unwrap();
        }
        assert_eq!(gear.state(), GearState::Reached);
    }

    #[test]
    fn test_clutch_in_is_ignored() {
        let config = GearConfig::default();
        let mut gear = Gear::new(1);
        for _ in 0..100 {
            let mut sample = geared_sample(1, 5000.0, 3.5);
            sample.clutch = crate::units::Percentage::FULL;
            gear.update(&sample, &config).unwrap();
        }
        assert_eq!(gear.state(), GearState::Reached);
        assert_eq!(gear.ratio(), None);
    }

    #[test]
    fn test_shift_rpm_matches_parabola() {
        let curve = parabola_curve();
        for ratio in [1.1, 1.2, 1.3] {
            let (shift, noisy) = calculate_shift_rpm(curve.rpm(), curve.power(), ratio);
            let expected = 12000.0 * ratio / (ratio + 1.0);
            assert!((shift - expected).abs() < 10.0, "ratio {ratio}: {shift} vs {expected}");
            assert!(!noisy);
        }
    }

    #[test]
    fn test_shift_rpm_monotonic_and_bounded() {
        let curve = parabola_curve();
        let mut previous = 0.0;
        for step in 0..20 {
            let ratio = 1.05 + step as f64 * 0.05;
            let (shift, _) = calculate_shift_rpm(curve.rpm(), curve.power(), ratio);
            assert!(shift >= previous, "ratio {ratio}");
            assert!(shift <= curve.revlimit());
            previous = shift;
        }
        // Beyond 1.4 the curves no longer cross before the rev limit
        let (shift, _) = calculate_shift_rpm(curve.rpm(), curve.power(), 1.5);
        assert_eq!(shift, 7000.0);
    }

    /// Power with a dip at 5000 RPM, so a 1.25 stretch crosses it three times
    fn dipped_curve() -> EngineCurve {
        let rpm: Vec<f64> = (1..=8).map(|i| i as f64 * 1000.0).collect();
        let power = vec![1.0, 2.0, 3.0, 4.0, 2.0, 4.0, 3.0, 2.0];
        let torque: Vec<f64> = rpm.iter().zip(&power).map(|(r, p)| p / r).collect();
        EngineCurve::from_points(rpm, torque, power, PowerUnit::Absolute).unwrap()
    }

    #[test]
    fn test_multiple_intersections_flag_noisy_curve() {
        let curve = dipped_curve();
        let (shift, noisy) = calculate_shift_rpm(curve.rpm(), curve.power(), 1.25);

        assert!(noisy);
        // Last crossing, between 6250 and 7000 RPM
        assert_eq!(shift, (90000.0_f64 / 13.0).round());
    }

    #[test]
    fn test_noisy_flag_reaches_gear_info() {
        let mut gears = Gears::new(GearConfig::default());
        for _ in 0..60 {
            gears.update(&geared_sample(2, 5000.0, 2.5));
            gears.update(&geared_sample(3, 5000.0, 2.0));
        }
        assert_eq!(gears.calculate_shift_rpms(&dipped_curve()), vec![2]);

        let info = gears.gear(2).unwrap().info();
        assert!(info.noisy);
        assert_eq!(info.shift_rpm, Some(6923.0));
    }

    #[test]
    fn test_relative_ratio_known_at_lock() {
        let mut gears = Gears::new(GearConfig::default());
        for _ in 0..60 {
            gears.update(&geared_sample(2, 5000.0, 2.4));
        }
        assert_eq!(gears.gear(2).and_then(Gear::relative_ratio), None);

        for _ in 0..60 {
            gears.update(&geared_sample(3, 5000.0, 2.0));
        }
        let relative = gears.gear(2).and_then(Gear::relative_ratio).unwrap();
        assert!((relative - 1.2).abs() < 1e-3);
        assert_eq!(gears.gear(3).and_then(Gear::relative_ratio), None);
        assert_eq!(gears.gear(2).map(Gear::state), Some(GearState::Locked));
        assert_eq!(gears.info()[1].shift_rpm, None);
    }

    #[test]
    fn test_gears_calculate_and_regress() {
        let mut gears = Gears::new(GearConfig::default());
        for _ in 0..60 {
            gears.update(&geared_sample(2, 5000.0, 2.4));
            gears.update(&geared_sample(3, 5000.0, 2.0));
        }
        assert_eq!(gears.gear(2).map(Gear::state), Some(GearState::Locked));
        assert_eq!(gears.gear(3).map(Gear::state), Some(GearState::Locked));

        let curve = parabola_curve();
        assert_eq!(gears.calculate_shift_rpms(&curve), vec![2]);
        assert_eq!(gears.gear(2).map(Gear::state), Some(GearState::Calculated));
        let shift = gears.shift_rpm_of(2).unwrap();
        assert!((shift - 12000.0 * 1.2 / 2.2).abs() < 10.0);
        assert_eq!(gears.shift_rpm_of(3), None);
        assert_eq!(gears.shift_rpm_of(-1), None);

        gears.regress_all();
        assert_eq!(gears.gear(2).map(Gear::state), Some(GearState::Locked));
        assert_eq!(gears.calculate_shift_rpms(&curve), vec![2]);
    }

    #[test]
    fn test_highest_gear_from_source() {
        let mut gears = Gears::new(GearConfig::default());
        assert!(!gears.is_highest(6));

        let mut sample = geared_sample(3, 5000.0, 2.0);
        sample.gear_count = Some(6);
        gears.update(&sample);

        assert!(gears.is_highest(6));
        assert!(!gears.is_highest(5));
    }

    #[test]
    fn test_reset_equals_fresh() {
        let mut gears = Gears::new(GearConfig::default());
        for _ in 0..60 {
            gears.update(&geared_sample(1, 5000.0, 3.2));
        }
        gears.reset();
        assert_eq!(gears, Gears::new(GearConfig::default()));
    }
}
