//! RPM forecasting
//!
//! A short window of recent RPM values fitted with a straight line. The line
//! is anchored on the newest sample (x = 0), so the intercept is the smoothed
//! current RPM and the slope is RPM gained per sample.

use crate::config::LookaheadConfig;
use crate::model::Sample;
use std::collections::VecDeque;

/// RPM that only follows the raw value once it moved far enough
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HysteresisRpm {
    value: f64,
}

impl HysteresisRpm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update from a sample; the threshold is `percent` of the engine max RPM
    pub fn update(&mut self, sample: &Sample, percent: f64) -> f64 {
        let rpm = sample.rpm().round();
        let hysteresis = percent * sample.engine_max_rpm.as_f64();
        if (rpm - self.value).abs() >= hysteresis {
            self.value = rpm;
        }
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn reset(&mut self) {
        self.value = 0.0;
    }
}

/// Bounded RPM window with a least-squares line
#[derive(Debug, Clone, PartialEq)]
pub struct Lookahead {
    min_len: usize,
    max_len: usize,
    window: VecDeque<f64>,
    line: Option<(f64, f64)>,
}

impl Lookahead {
    pub fn new(config: &LookaheadConfig) -> Self {
        Self {
            min_len: config.min_len.max(2),
            max_len: config.max_len.max(config.min_len),
            window: VecDeque::with_capacity(config.max_len),
            line: None,
        }
    }

    pub fn add(&mut self, rpm: f64) {
        self.window.push_back(rpm);
        while self.window.len() > self.max_len {
            self.window.pop_front();
        }
        if self.window.len() >= self.min_len {
            self.line = Some(self.regression());
        }
    }

    /// (slope, intercept) over x = -(n - 1) ..= 0
    fn regression(&self) -> (f64, f64) {
        let n = self.window.len() as f64;
        let x_mean = -(n - 1.0) / 2.0;
        let y_mean = self.window.iter().sum::<f64>() / n;

        let (mut sxy, mut sxx) = (0.0, 0.0);
        for (i, y) in self.window.iter().enumerate() {
            let dx = (i as f64 - (n - 1.0)) - x_mean;
            sxy += dx * (y - y_mean);
            sxx += dx * dx;
        }
        let slope = sxy / sxx;
        (slope, y_mean - slope * x_mean)
    }

    pub fn slope(&self) -> Option<f64> {
        self.line.map(|(slope, _)| slope)
    }

    pub fn intercept(&self) -> Option<f64> {
        self.line.map(|(_, intercept)| intercept)
    }

    /// Whether `target` is reached within `lead` samples
    ///
    /// `slope_factor` scales the fitted slope, e.g. by the torque ratio
    /// between the target and the current RPM.
    pub fn test(&self, target: f64, lead: f64, slope_factor: f64) -> bool {
        let Some((slope, intercept)) = self.line else {
            return false;
        };
        if self.window.len() < self.min_len || slope <= 0.0 || slope_factor <= 0.0 {
            return false;
        }
        let distance = (target - intercept) / (slope * slope_factor);
        (0.0..=lead).contains(&distance)
    }

    /// Forecast RPM `lead` samples ahead
    pub fn forecast(&self, lead: f64) -> Option<f64> {
        self.line.map(|(slope, intercept)| intercept + slope * lead)
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn clear(&mut self) {
        self.window.clear();
        self.line = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::Rpm;

    fn filled(values: impl IntoIterator<Item = f64>) -> Lookahead {
        let mut lookahead = Lookahead::new(&LookaheadConfig::default());
        values.into_iter().for_each(|v| lookahead.add(v));
        lookahead
    }

    #[test]
    fn test_regression_anchored_on_newest() {
        let lookahead = filled((0..20).map(|i| 5000.0 + i as f64 * 10.0));
        assert!((lookahead.slope().unwrap() - 10.0).abs() < 1e-9);
        assert!((lookahead.intercept().unwrap() - 5190.0).abs() < 1e-9);
        assert!((lookahead.forecast(10.0).unwrap() - 5290.0).abs() < 1e-9);
    }

    #[test]
    fn test_window_is_bounded() {
        let lookahead = filled((0..50).map(|i| i as f64));
        assert_eq!(lookahead.len(), 20);
        assert!((lookahead.intercept().unwrap() - 49.0).abs() < 1e-9);
    }

    #[test]
    fn test_short_window_never_fires() {
        let lookahead = filled((0..14).map(|i| 5000.0 + i as f64 * 10.0));
        assert_eq!(lookahead.slope(), None);
        assert!(!lookahead.test(5150.0, 17.0, 1.0));
    }

    #[test]
    fn test_reaches_target_within_lead() {
        let lookahead = filled((0..20).map(|i| 5000.0 + i as f64 * 10.0));
        // 100 RPM ahead at 10 RPM per sample
        assert!(lookahead.test(5290.0, 10.0, 1.0));
        assert!(!lookahead.test(5290.0, 9.0, 1.0));
        // Half the torque doubles the distance
        assert!(!lookahead.test(5290.0, 10.0, 0.5));
        assert!(lookahead.test(5290.0, 20.0, 0.5));
        // Already past the target
        assert!(!lookahead.test(5100.0, 10.0, 1.0));
    }

    #[test]
    fn test_non_positive_slope_or_factor() {
        let falling = filled((0..20).map(|i| 7000.0 - i as f64 * 10.0));
        assert!(!falling.test(6500.0, 100.0, 1.0));

        let rising = filled((0..20).map(|i| 5000.0 + i as f64 * 10.0));
        assert!(!rising.test(5290.0, 10.0, 0.0));
    }

    #[test]
    fn test_clear() {
        let mut lookahead = filled((0..20).map(|i| i as f64));
        lookahead.clear();
        assert!(lookahead.is_empty());
        assert_eq!(lookahead, Lookahead::new(&LookaheadConfig::default()));
    }

    #[test]
    fn test_hysteresis_rpm() {
        let mut rpm = HysteresisRpm::new();
        let mut sample = Sample {
            rpm: Rpm(5000.0),
            engine_max_rpm: Rpm(8000.0),
            ..Default::default()
        };
        // 1% of 8000 RPM
        assert_eq!(rpm.update(&sample, 0.01), 5000.0);

        sample.rpm = Rpm(5050.0);
        assert_eq!(rpm.update(&sample, 0.01), 5000.0);

        sample.rpm = Rpm(5090.0);
        assert_eq!(rpm.update(&sample, 0.01), 5090.0);

        sample.rpm = Rpm(5091.4);
        assert_eq!(rpm.update(&sample, 0.0), 5091.0);
    }
}
