//! Engine curve construction
//!
//! Turns an acceleration run and a coasting run into a torque/power curve.
//! Without the car's mass or wheel size the result is a relative curve: its
//! shape is correct, its scale is not. Games that report native torque and
//! power get an absolute curve instead.
//!
//! Pipeline:
//! 1. `VtaCurve`: velocity/time/acceleration traces from a run, with rolling
//!    averages applied to velocity.
//! 2. `DragFit`: deceleration versus velocity from the coasting run.
//! 3. `EngineCurve`: accel minus drag, loop removal, sort, resample, final
//!    point correction at the rev limit.

use crate::config::CurveConfig;
use crate::model::Sample;
use crate::units::round_to;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, PartialEq)]
pub enum CurveError {
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error("degenerate fit: {0}")]
    DegenerateFit(String),

    #[error("smoothing window {window} does not fit {len} samples")]
    BadWindow { window: usize, len: usize },

    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },
}

// === Numeric helpers ===

/// Centered moving average, keeping only fully covered positions
fn rolling_avg(values: &[f64], window: usize) -> Vec<f64> {
    values
        .windows(window)
        .map(|w| w.iter().sum::<f64>() / window as f64)
        .collect()
}

/// Derivative of `f` over non-uniformly spaced `t`
///
/// Second-order central differences in the interior, one-sided differences
/// at both ends.
fn gradient(f: &[f64], t: &[f64]) -> Vec<f64> {
    let n = f.len();
    let mut out = vec![0.0; n];
    if n < 2 {
        return out;
    }

    out[0] = (f[1] - f[0]) / (t[1] - t[0]);
    out[n - 1] = (f[n - 1] - f[n - 2]) / (t[n - 1] - t[n - 2]);

    for i in 1..n - 1 {
        let hs = t[i] - t[i - 1];
        let hd = t[i + 1] - t[i];
        out[i] = (hs * hs * f[i + 1] + (hd * hd - hs * hs) * f[i] - hd * hd * f[i - 1])
            / (hs * hd * (hd + hs));
    }
    out
}

/// Linear interpolation of `ys` at `x`, clamped to the end values.
/// `xs` must be sorted ascending.
pub(crate) fn interpolate(xs: &[f64], ys: &[f64], x: f64) -> f64 {
    let (Some(&first), Some(&last)) = (xs.first(), xs.last()) else {
        return 0.0;
    };
    if x <= first {
        return ys[0];
    }
    if x >= last {
        return ys[ys.len() - 1];
    }

    let i = xs.partition_point(|&v| v < x);
    if xs[i] == x {
        return ys[i];
    }
    let (x0, x1) = (xs[i - 1], xs[i]);
    let (y0, y1) = (ys[i - 1], ys[i]);
    y0 + (y1 - y0) * (x - x0) / (x1 - x0)
}

/// Intersection point of segments (p1, p2) and (p3, p4), if any
pub(crate) fn segment_intersection(
    p1: (f64, f64),
    p2: (f64, f64),
    p3: (f64, f64),
    p4: (f64, f64),
) -> Option<(f64, f64)> {
    let (x1, y1) = p1;
    let (x2, y2) = p2;
    let (x3, y3) = p3;
    let (x4, y4) = p4;

    let d = (x1 - x2) * (y3 - y4) - (y1 - y2) * (x3 - x4);
    if d == 0.0 {
        return None;
    }
    let xs = ((x1 * y2 - y1 * x2) * (x3 - x4) - (x1 - x2) * (x3 * y4 - y3 * x4)) / d;
    let ys = ((x1 * y2 - y1 * x2) * (y3 - y4) - (y1 - y2) * (x3 * y4 - y3 * x4)) / d;

    let within = |a: f64, b: f64| xs >= a.min(b) && xs <= a.max(b);
    (within(x1, x2) && within(x3, x4)).then_some((xs, ys))
}

/// Remove self-intersecting loops from a trace, then sort by x
///
/// A single run oscillates: the trace overshoots, drops back and crosses
/// itself. Everything between the two crossing segments is dropped. Only
/// loops spanning fewer than `max_loop` points are searched for.
pub(crate) fn deloop_and_sort<T: Clone>(
    points: &[T],
    key: impl Fn(&T) -> (f64, f64),
    max_loop: usize,
) -> Vec<T> {
    let xy: Vec<(f64, f64)> = points.iter().map(&key).collect();
    let n = xy.len();
    let mut keep = vec![true; n];

    let mut i = 0;
    while i + 2 < n {
        let end = (n - 2).min(i + max_loop);
        let hit = (i + 2..end)
            .find(|&j| segment_intersection(xy[i], xy[i + 1], xy[j], xy[j + 1]).is_some());
        match hit {
            Some(j) => {
                keep[i + 1..=j].iter_mut().for_each(|k| *k = false);
                i = j;
            }
            None => i += 1,
        }
    }

    let mut out: Vec<T> = points
        .iter()
        .zip(keep)
        .filter_map(|(p, k)| k.then(|| p.clone()))
        .collect();
    out.sort_by(|a, b| key(a).0.total_cmp(&key(b).0));
    out
}

// === Velocity / time / acceleration ===

/// Velocity, time and acceleration traces of a run
#[derive(Debug, Clone, PartialEq)]
pub struct VtaCurve {
    pub rpm: Vec<f64>,
    pub velocity: Vec<f64>,
    pub time: Vec<f64>,
    pub accel: Vec<f64>,

    /// Highest RPM in the raw run
    pub revlimit: f64,
    pub gear: i8,
}

impl VtaCurve {
    /// Build the traces from a run
    ///
    /// Rolling averages are applied to velocity only; RPM and time are trimmed
    /// by half a window on each side to stay aligned. Even windows are bumped
    /// to the next odd size.
    pub fn from_run(run: &[Sample], windows: &[usize], tick_rate: f64) -> Result<Self, CurveError> {
        let mut samples: Vec<&Sample> = run.iter().collect();
        samples.sort_by_key(|s| s.index);
        samples.dedup_by_key(|s| s.index);

        let (Some(first), Some(last)) = (samples.first(), samples.last()) else {
            return Err(CurveError::InsufficientData("empty run".into()));
        };
        let first_index = first.index;
        if (last.index - first_index + 1) as usize != samples.len() {
            debug!("Run is missing samples");
        }

        let revlimit = samples.iter().map(|s| s.rpm()).fold(f64::MIN, f64::max);
        let gear = first.gear;

        let mut rpm: Vec<f64> = samples.iter().map(|s| s.rpm()).collect();
        let mut velocity: Vec<f64> = samples.iter().map(|s| s.speed.0 as f64).collect();
        let mut time_id: Vec<f64> = samples
            .iter()
            .map(|s| (s.index - first_index) as f64)
            .collect();

        for &window in windows {
            let window = if window % 2 == 0 { window + 1 } else { window };
            if window > velocity.len() {
                return Err(CurveError::BadWindow {
                    window,
                    len: velocity.len(),
                });
            }
            let cutoff = window / 2;
            let end = rpm.len() - cutoff;
            rpm = rpm[cutoff..end].to_vec();
            time_id = time_id[cutoff..end].to_vec();
            velocity = rolling_avg(&velocity, window);
        }

        if velocity.len() < 2 {
            return Err(CurveError::InsufficientData(format!(
                "{} samples left after smoothing",
                velocity.len()
            )));
        }

        let time: Vec<f64> = time_id.iter().map(|t| t / tick_rate).collect();
        let accel = gradient(&velocity, &time);

        Ok(Self {
            rpm,
            velocity,
            time,
            accel,
            revlimit,
            gear,
        })
    }

    pub fn len(&self) -> usize {
        self.rpm.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rpm.is_empty()
    }
}

// === Drag fit ===

/// Deceleration as a polynomial in velocity without a constant term
#[derive(Debug, Clone, PartialEq)]
pub struct DragFit {
    /// Coefficient of v^(i + 1)
    coefficients: Vec<f64>,
}

impl DragFit {
    /// Least-squares fit of acceleration against velocity, terms v^1..v^degree
    pub fn fit(drag: &VtaCurve, degree: usize) -> Result<Self, CurveError> {
        if degree == 0 {
            return Err(CurveError::DegenerateFit("degree must be at least 1".into()));
        }
        if drag.len() < degree {
            return Err(CurveError::InsufficientData(format!(
                "{} drag samples for degree {}",
                drag.len(),
                degree
            )));
        }

        // Normal equations: (A^T A) c = A^T y
        let mut ata = vec![vec![0.0; degree]; degree];
        let mut aty = vec![0.0; degree];
        for (&v, &a) in drag.velocity.iter().zip(&drag.accel) {
            let terms: Vec<f64> = (1..=degree).map(|p| v.powi(p as i32)).collect();
            for r in 0..degree {
                aty[r] += terms[r] * a;
                for c in 0..degree {
                    ata[r][c] += terms[r] * terms[c];
                }
            }
        }

        let coefficients = solve(ata, aty)
            .ok_or_else(|| CurveError::DegenerateFit("singular drag matrix".into()))?;
        Ok(Self { coefficients })
    }

    /// Fitted acceleration at velocity `v` (negative while coasting)
    pub fn evaluate(&self, v: f64) -> f64 {
        self.coefficients
            .iter()
            .enumerate()
            .map(|(i, c)| c * v.powi(i as i32 + 1))
            .sum()
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coefficients
    }
}

/// Gaussian elimination with partial pivoting
fn solve(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);

        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let sum: f64 = (row + 1..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - sum) / a[row][row];
    }
    x.iter().all(|v| v.is_finite()).then_some(x)
}

// === Engine curve ===

/// Whether power values are scaled to a peak of 1.0 or in watts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerUnit {
    Relative,
    Absolute,
}

/// Summary of the accel run a curve was built from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurveOrigin {
    pub gear: i8,
    pub revlimit: f64,
    pub start_rpm: f64,
    pub sample_count: usize,
}

impl CurveOrigin {
    fn from_run(run: &[Sample]) -> Option<Self> {
        let first = run.first()?;
        let last = run.last()?;
        Some(Self {
            gear: first.gear,
            revlimit: last.rpm(),
            start_rpm: first.rpm(),
            sample_count: run.len(),
        })
    }
}

/// Torque and power by RPM, sorted by RPM, ending exactly at the rev limit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineCurve {
    rpm: Box<[f64]>,
    torque: Box<[f64]>,
    power: Box<[f64]>,
    revlimit: f64,
    unit: PowerUnit,

    /// `None` for curves loaded from disk
    origin: Option<CurveOrigin>,
}

impl EngineCurve {
    /// Build a relative curve from an accel run and a coasting run
    pub fn from_runs(
        accel: &[Sample],
        drag: &[Sample],
        config: &CurveConfig,
        tick_rate: f64,
    ) -> Result<Self, CurveError> {
        let accel_vta = VtaCurve::from_run(accel, &config.smoothing_windows, tick_rate)?;
        let drag_vta = VtaCurve::from_run(drag, &config.drag_smoothing_windows, tick_rate)?;
        let drag_fit = DragFit::fit(&drag_vta, config.drag_fit_degree)?;
        debug!("Drag fit coefficients {:?}", drag_fit.coefficients());

        let points: Vec<(f64, f64)> = accel_vta
            .rpm
            .iter()
            .zip(accel_vta.velocity.iter().zip(&accel_vta.accel))
            .map(|(&rpm, (&v, &a))| (rpm, a - drag_fit.evaluate(v)))
            .collect();
        let points = deloop_and_sort(&points, |&p| p, config.max_loop);

        let rpm: Vec<f64> = points.iter().map(|p| p.0).collect();
        let torque: Vec<f64> = points.iter().map(|p| p.1).collect();
        let power: Vec<f64> = rpm.iter().zip(&torque).map(|(r, t)| r * t).collect();

        let peak = power.iter().copied().fold(f64::MIN, f64::max);
        if !(peak > 0.0 && peak.is_finite()) {
            return Err(CurveError::DegenerateFit(format!("peak power {peak}")));
        }
        let torque: Vec<f64> = torque.iter().map(|t| t / peak).collect();
        let power: Vec<f64> = power.iter().map(|p| p / peak).collect();

        Self::build(
            rpm,
            torque,
            power,
            accel_vta.revlimit,
            config,
            PowerUnit::Relative,
            CurveOrigin::from_run(accel),
        )
    }

    /// Build an absolute curve from the native torque and power in a run
    pub fn from_native_run(run: &[Sample], config: &CurveConfig) -> Result<Self, CurveError> {
        let points: Vec<(f64, f64, f64)> = run
            .iter()
            .map(|s| match (s.torque, s.power) {
                (Some(t), Some(p)) => Some((s.rpm(), t.0 as f64, p.0 as f64)),
                _ => None,
            })
            .collect::<Option<_>>()
            .ok_or_else(|| CurveError::InsufficientData("run lacks native torque".into()))?;

        let revlimit = points.iter().map(|p| p.0).fold(f64::MIN, f64::max);
        let points = deloop_and_sort(&points, |&(r, _, p)| (r, p), config.max_loop);

        Self::build(
            points.iter().map(|p| p.0).collect(),
            points.iter().map(|p| p.1).collect(),
            points.iter().map(|p| p.2).collect(),
            revlimit,
            config,
            PowerUnit::Absolute,
            CurveOrigin::from_run(run),
        )
    }

    /// Wrap already finalized points, as read back from storage
    pub fn from_points(
        rpm: Vec<f64>,
        torque: Vec<f64>,
        power: Vec<f64>,
        unit: PowerUnit,
    ) -> Result<Self, CurveError> {
        if rpm.len() < 2 || rpm.len() != torque.len() || rpm.len() != power.len() {
            return Err(CurveError::InsufficientData(format!(
                "{} rpm, {} torque, {} power points",
                rpm.len(),
                torque.len(),
                power.len()
            )));
        }
        if rpm.windows(2).any(|w| w[0] > w[1]) {
            return Err(CurveError::InsufficientData("rpm not sorted".into()));
        }
        let revlimit = rpm[rpm.len() - 1];

        Ok(Self {
            rpm: rpm.into_boxed_slice(),
            torque: torque.into_boxed_slice(),
            power: power.into_boxed_slice(),
            revlimit,
            unit,
            origin: None,
        })
    }

    /// Resample onto the RPM grid and pin the final point to the rev limit
    fn build(
        rpm: Vec<f64>,
        torque: Vec<f64>,
        power: Vec<f64>,
        raw_revlimit: f64,
        config: &CurveConfig,
        unit: PowerUnit,
        origin: Option<CurveOrigin>,
    ) -> Result<Self, CurveError> {
        let (Some(&low), Some(&high)) = (rpm.first(), rpm.last()) else {
            return Err(CurveError::InsufficientData("no curve points".into()));
        };

        let interval = config.rpm_interval;
        if !(interval > 0.0 && interval.is_finite() && low.is_finite() && high.is_finite()) {
            return Err(CurveError::InsufficientData(format!(
                "cannot resample {low} to {high} RPM every {interval} RPM"
            )));
        }
        let mut grid = Vec::new();
        let mut x = (low / interval).ceil() * interval;
        while x <= high {
            grid.push(x);
            x += interval;
        }
        if grid.len() < 2 {
            return Err(CurveError::InsufficientData(format!(
                "curve spans {low:.0} to {high:.0} RPM"
            )));
        }

        let grid_torque: Vec<f64> = grid.iter().map(|&x| interpolate(&rpm, &torque, x)).collect();
        let grid_power: Vec<f64> = grid.iter().map(|&x| interpolate(&rpm, &power, x)).collect();

        let limit = if config.revlimit_round > 0.0 {
            round_to(raw_revlimit, config.revlimit_round)
        } else {
            raw_revlimit
        };

        let (rpm, torque, power) = correct_final_point(
            grid,
            grid_torque,
            grid_power,
            limit,
            config.revlimit_round_offset,
        )?;

        Ok(Self {
            rpm: rpm.into_boxed_slice(),
            torque: torque.into_boxed_slice(),
            power: power.into_boxed_slice(),
            revlimit: limit,
            unit,
            origin,
        })
    }

    pub fn rpm(&self) -> &[f64] {
        &self.rpm
    }

    pub fn torque(&self) -> &[f64] {
        &self.torque
    }

    pub fn power(&self) -> &[f64] {
        &self.power
    }

    pub fn revlimit(&self) -> f64 {
        self.revlimit
    }

    pub fn unit(&self) -> PowerUnit {
        self.unit
    }

    pub fn origin(&self) -> Option<&CurveOrigin> {
        self.origin.as_ref()
    }

    /// Torque at `rpm`, linearly interpolated and clamped to the curve ends
    pub fn torque_at_rpm(&self, rpm: f64) -> f64 {
        interpolate(&self.rpm, &self.torque, rpm)
    }

    /// Torque at `target` relative to torque at `current`
    ///
    /// Scales the RPM slope when predicting: the engine accelerates slower
    /// where it makes less torque. Returns 1.0 when either value is unusable.
    pub fn torque_ratio(&self, current: f64, target: f64) -> f64 {
        let current_torque = self.torque_at_rpm(current);
        if current_torque == 0.0 || !current_torque.is_finite() {
            return 1.0;
        }
        let ratio = self.torque_at_rpm(target) / current_torque;
        if ratio.is_finite() {
            ratio
        } else {
            1.0
        }
    }

    /// (RPM, power) at peak power, with power rounded to `decimals` places
    ///
    /// Rounding first keeps the reported RPM stable between curves collected
    /// from different runs.
    pub fn peak_power(&self, decimals: i32) -> (f64, f64) {
        let scale = 10f64.powi(decimals);
        let mut best = (self.rpm[0], f64::MIN);
        for (&rpm, &power) in self.rpm.iter().zip(self.power.iter()) {
            let rounded = (power * scale).round() / scale;
            if rounded > best.1 {
                best = (rpm, rounded);
            }
        }
        best
    }
}

/// Make the curve end exactly at `limit`
///
/// Points at or above `limit - offset` are dropped and replaced with one
/// point at the limit. Its torque and power are interpolated at the limit
/// rather than copied from the first dropped point, which may sit up to a
/// grid step past it. A curve that stops short is extended linearly from its
/// last two points.
fn correct_final_point(
    mut rpm: Vec<f64>,
    mut torque: Vec<f64>,
    mut power: Vec<f64>,
    limit: f64,
    offset: f64,
) -> Result<(Vec<f64>, Vec<f64>, Vec<f64>), CurveError> {
    match rpm.iter().position(|&r| r >= limit - offset) {
        Some(k) => {
            let t = interpolate(&rpm, &torque, limit);
            let p = interpolate(&rpm, &power, limit);
            rpm.truncate(k);
            torque.truncate(k);
            power.truncate(k);
            rpm.push(limit);
            torque.push(t);
            power.push(p);
        }
        None => {
            let n = rpm.len();
            let (x1, x2) = (rpm[n - 2], rpm[n - 1]);
            let extend = |ys: &[f64]| {
                let (y1, y2) = (ys[n - 2], ys[n - 1]);
                (y2 - y1) / (x2 - x1) * (limit - x2) + y2
            };
            let t = extend(&torque);
            let p = extend(&power);
            rpm.push(limit);
            torque.push(t);
            power.push(p);
        }
    }

    if rpm.len() < 2 {
        warn!("Curve collapsed to the rev limit point");
        return Err(CurveError::InsufficientData(format!(
            "no points below rev limit {limit:.0}"
        )));
    }
    Ok((rpm, torque, power))
}

// === Persistence format ===

/// Tab-separated `rpm power torque` text, one row per curve point
pub mod tsv {
    use super::{CurveError, EngineCurve, PowerUnit};

    pub const COLUMNS: [&str; 3] = ["rpm", "power", "torque"];
    const DELIMITER: char = '\t';

    pub fn write(curve: &EngineCurve) -> String {
        let mut out = COLUMNS.join("\t");
        out.push('\n');
        for ((rpm, power), torque) in curve.rpm().iter().zip(curve.power()).zip(curve.torque()) {
            out.push_str(&format!("{rpm:.0}{DELIMITER}{power:.4}{DELIMITER}{torque:.4}\n"));
        }
        out
    }

    /// Parse a curve written by [`write`]
    ///
    /// The file does not record its unit: a peak power above 1.0 means the
    /// values are absolute.
    pub fn parse(text: &str) -> Result<EngineCurve, CurveError> {
        let mut lines = text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());

        let header = lines.next().map(|(_, l)| l).unwrap_or_default();
        let columns: Vec<&str> = header.split(DELIMITER).map(str::trim).collect();
        if columns != COLUMNS {
            return Err(CurveError::Parse {
                line: 1,
                message: format!("unexpected header {header:?}"),
            });
        }

        let mut rpm = Vec::new();
        let mut power = Vec::new();
        let mut torque = Vec::new();
        for (i, line) in lines {
            let fields: Vec<&str> = line.split(DELIMITER).collect();
            if fields.len() != COLUMNS.len() {
                return Err(CurveError::Parse {
                    line: i + 1,
                    message: format!("expected {} fields, got {}", COLUMNS.len(), fields.len()),
                });
            }
            let mut values = [0.0; 3];
            for (value, field) in values.iter_mut().zip(&fields) {
                *value = field.trim().parse().map_err(|e| CurveError::Parse {
                    line: i + 1,
                    message: format!("{field:?}: {e}"),
                })?;
            }
            rpm.push(values[0]);
            power.push(values[1]);
            torque.push(values[2]);
        }

        let peak = power.iter().copied().fold(f64::MIN, f64::max);
        let unit = if peak > 1.0 + 1e-3 {
            PowerUnit::Absolute
        } else {
            PowerUnit::Relative
        };
        EngineCurve::from_points(rpm, torque, power, unit)
    }
}
