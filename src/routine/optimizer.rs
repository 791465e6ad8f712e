//! Black-box optimizers driving Minimize/Maximize routines.
//!
//! Optimizers always minimize a cost; the routine negates the objective for
//! maximization. Both keep their search history across calls.

use crate::error::{AppResult, DaqError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;

/// Ask/tell interface over a bounded parameter vector.
pub trait Optimizer: Send + fmt::Debug {
    /// Next point to evaluate, inside the bounds.
    fn ask(&mut self) -> Vec<f64>;

    /// Reports the averaged cost observed at `x` (which may differ from the asked point
    /// if the routine limited the step).
    fn tell(&mut self, x: &[f64], cost: f64);

    /// Lowest-cost point seen so far.
    fn best(&self) -> Option<(Vec<f64>, f64)>;

    /// Fraction of the routine window elapsed, in `[0, 1]`.
    fn set_progress(&mut self, _fraction: f64) {}
}

/// Per-dimension `(lower, upper)` bounds.
pub type Bounds = Vec<(f64, f64)>;

pub(crate) fn check_bounds(bounds: &Bounds) -> AppResult<()> {
    if bounds.is_empty() {
        return Err(DaqError::Configuration("optimizer needs at least one knob".to_string()));
    }
    for (i, (lo, hi)) in bounds.iter().enumerate() {
        if !lo.is_finite() || !hi.is_finite() || lo >= hi {
            return Err(DaqError::Configuration(format!(
                "bounds for dimension {} must be finite with lower < upper, got ({}, {})",
                i, lo, hi
            )));
        }
    }
    Ok(())
}

fn clamp_to(bounds: &Bounds, x: &mut [f64]) {
    for (xi, (lo, hi)) in x.iter_mut().zip(bounds) {
        *xi = xi.clamp(*lo, *hi);
    }
}

// =============================================================================
// Direct search
// =============================================================================

/// Compass search: try `±step` along each axis from the base point, move on the first
/// improvement, halve the steps after a full unsuccessful sweep.
#[derive(Debug, Clone)]
pub struct DirectSearch {
    bounds: Bounds,
    base: Vec<f64>,
    base_cost: Option<f64>,
    step: Vec<f64>,
    min_step: Vec<f64>,
    direction: usize,
}

impl DirectSearch {
    /// Starts at the centre of the bounds with steps of a quarter of each range.
    pub fn new(bounds: Bounds) -> AppResult<Self> {
        check_bounds(&bounds)?;
        let base = bounds.iter().map(|(lo, hi)| 0.5 * (lo + hi)).collect();
        let step = bounds.iter().map(|(lo, hi)| 0.25 * (hi - lo)).collect();
        let min_step = bounds.iter().map(|(lo, hi)| 1e-4 * (hi - lo)).collect();
        Ok(Self {
            bounds,
            base,
            base_cost: None,
            step,
            min_step,
            direction: 0,
        })
    }

    pub fn with_start(mut self, start: Vec<f64>) -> AppResult<Self> {
        if start.len() != self.bounds.len() {
            return Err(DaqError::Configuration(format!(
                "start point has {} dimensions, bounds have {}",
                start.len(),
                self.bounds.len()
            )));
        }
        self.base = start;
        clamp_to(&self.bounds, &mut self.base);
        Ok(self)
    }

    /// Initial step as a fraction of each bound range.
    pub fn with_step_fraction(mut self, fraction: f64) -> Self {
        self.step = self
            .bounds
            .iter()
            .map(|(lo, hi)| fraction * (hi - lo))
            .collect();
        self
    }

    pub fn step(&self) -> &[f64] {
        &self.step
    }
}

impl Optimizer for DirectSearch {
    fn ask(&mut self) -> Vec<f64> {
        let mut x = self.base.clone();
        if self.base_cost.is_some() {
            let axis = self.direction / 2;
            let sign = if self.direction % 2 == 0 { 1.0 } else { -1.0 };
            x[axis] += sign * self.step[axis];
            clamp_to(&self.bounds, &mut x);
        }
        x
    }

    fn tell(&mut self, x: &[f64], cost: f64) {
        match self.base_cost {
            Some(base_cost) if cost >= base_cost => {
                self.direction += 1;
                if self.direction == 2 * self.bounds.len() {
                    self.direction = 0;
                    for (step, min) in self.step.iter_mut().zip(&self.min_step) {
                        *step = (*step * 0.5).max(*min);
                    }
                }
            }
            _ => {
                self.base = x.to_vec();
                self.base_cost = Some(cost);
            }
        }
    }

    fn best(&self) -> Option<(Vec<f64>, f64)> {
        self.base_cost.map(|cost| (self.base.clone(), cost))
    }
}

// =============================================================================
// Bayesian surrogate
// =============================================================================

/// Gaussian-process surrogate with an RBF kernel and a confidence-bound acquisition.
///
/// The first `initial_points` proposals are uniform random. Afterwards the proposal is
/// the candidate minimizing `mean - kappa * stddev`, where `kappa` shrinks linearly to
/// zero as the routine window elapses.
#[derive(Debug)]
pub struct Bayesian {
    bounds: Bounds,
    rng: StdRng,
    xs: Vec<Vec<f64>>,
    ys: Vec<f64>,
    initial_points: usize,
    candidates: usize,
    length_scale: f64,
    noise: f64,
    kappa_start: f64,
    kappa: f64,
}

impl Bayesian {
    pub fn new(bounds: Bounds) -> AppResult<Self> {
        check_bounds(&bounds)?;
        let initial_points = 2 * bounds.len() + 1;
        Ok(Self {
            bounds,
            rng: StdRng::from_entropy(),
            xs: Vec::new(),
            ys: Vec::new(),
            initial_points,
            candidates: 512,
            length_scale: 0.2,
            noise: 1e-4,
            kappa_start: 2.5,
            kappa: 2.5,
        })
    }

    /// Reproducible proposals.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_kappa(mut self, kappa: f64) -> Self {
        self.kappa_start = kappa;
        self.kappa = kappa;
        self
    }

    pub fn with_length_scale(mut self, length_scale: f64) -> Self {
        self.length_scale = length_scale;
        self
    }

    pub fn kappa(&self) -> f64 {
        self.kappa
    }

    pub fn observations(&self) -> usize {
        self.ys.len()
    }

    fn to_unit(&self, x: &[f64]) -> Vec<f64> {
        x.iter()
            .zip(&self.bounds)
            .map(|(xi, (lo, hi))| ((xi - lo) / (hi - lo)).clamp(0.0, 1.0))
            .collect()
    }

    fn from_unit(&self, u: &[f64]) -> Vec<f64> {
        u.iter()
            .zip(&self.bounds)
            .map(|(ui, (lo, hi))| lo + ui * (hi - lo))
            .collect()
    }

    fn random_unit(&mut self) -> Vec<f64> {
        (0..self.bounds.len()).map(|_| self.rng.gen::<f64>()).collect()
    }

    fn kernel(&self, a: &[f64], b: &[f64]) -> f64 {
        let d2: f64 = a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum();
        (-0.5 * d2 / self.length_scale.powi(2)).exp()
    }

    fn propose(&mut self) -> Option<Vec<f64>> {
        let n = self.xs.len();
        let mean = self.ys.iter().sum::<f64>() / n as f64;
        let spread = (self.ys.iter().map(|y| (y - mean).powi(2)).sum::<f64>() / n as f64).sqrt();
        let scale = if spread > 0.0 { spread } else { 1.0 };
        let targets: Vec<f64> = self.ys.iter().map(|y| (y - mean) / scale).collect();

        let gram: Vec<Vec<f64>> = (0..n)
            .map(|i| {
                (0..n)
                    .map(|j| {
                        let k = self.kernel(&self.xs[i], &self.xs[j]);
                        if i == j {
                            k + self.noise
                        } else {
                            k
                        }
                    })
                    .collect()
            })
            .collect();
        let chol = cholesky(&gram)?;
        let alpha = solve_upper(&chol, &solve_lower(&chol, &targets));

        let best = self
            .ys
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| self.xs[i].clone())?;

        let mut chosen: Option<(f64, Vec<f64>)> = None;
        for c in 0..self.candidates {
            let candidate = if c % 4 == 0 {
                best.iter()
                    .map(|b| (b + self.rng.gen_range(-0.05..0.05)).clamp(0.0, 1.0))
                    .collect()
            } else {
                self.random_unit()
            };
            let k_star: Vec<f64> = self.xs.iter().map(|x| self.kernel(x, &candidate)).collect();
            let mu: f64 = k_star.iter().zip(&alpha).map(|(k, a)| k * a).sum();
            let v = solve_lower(&chol, &k_star);
            let variance = (1.0 - v.iter().map(|x| x * x).sum::<f64>()).max(0.0);
            let score = mu - self.kappa * variance.sqrt();
            if chosen.as_ref().map_or(true, |(s, _)| score < *s) {
                chosen = Some((score, candidate));
            }
        }
        chosen.map(|(_, u)| u)
    }
}

impl Optimizer for Bayesian {
    fn ask(&mut self) -> Vec<f64> {
        let unit = if self.xs.len() < self.initial_points {
            self.random_unit()
        } else {
            match self.propose() {
                Some(unit) => unit,
                None => self.random_unit(),
            }
        };
        self.from_unit(&unit)
    }

    fn tell(&mut self, x: &[f64], cost: f64) {
        if cost.is_finite() {
            self.xs.push(self.to_unit(x));
            self.ys.push(cost);
        }
    }

    fn best(&self) -> Option<(Vec<f64>, f64)> {
        self.ys
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, cost)| (self.from_unit(&self.xs[i]), *cost))
    }

    fn set_progress(&mut self, fraction: f64) {
        self.kappa = self.kappa_start * (1.0 - fraction.clamp(0.0, 1.0));
    }
}

/// Lower-triangular `L` with `L Lᵀ = a`, or `None` if `a` is not positive definite.
fn cholesky(a: &[Vec<f64>]) -> Option<Vec<Vec<f64>>> {
    let n = a.len();
    let mut l = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..=i {
            let sum: f64 = (0..j).map(|k| l[i][k] * l[j][k]).sum();
            if i == j {
                let d = a[i][i] - sum;
                if d <= 0.0 {
                    return None;
                }
                l[i][j] = d.sqrt();
            } else {
                l[i][j] = (a[i][j] - sum) / l[j][j];
            }
        }
    }
    Some(l)
}

fn solve_lower(l: &[Vec<f64>], b: &[f64]) -> Vec<f64> {
    let mut y = vec![0.0; b.len()];
    for i in 0..b.len() {
        let sum: f64 = (0..i).map(|k| l[i][k] * y[k]).sum();
        y[i] = (b[i] - sum) / l[i][i];
    }
    y
}

fn solve_upper(l: &[Vec<f64>], y: &[f64]) -> Vec<f64> {
    let n = y.len();
    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let sum: f64 = (i + 1..n).map(|k| l[k][i] * x[k]).sum();
        x[i] = (y[i] - sum) / l[i][i];
    }
    x
}
