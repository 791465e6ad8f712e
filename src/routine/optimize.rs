use super::optimizer::{check_bounds, Bounds, Optimizer};
use super::{Assignment, Window};
use crate::error::{AppResult, DaqError};
use crate::scheduler::State;
use std::str::FromStr;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Minimize,
    Maximize,
}

impl FromStr for Direction {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "minimize" | "min" => Ok(Direction::Minimize),
            "maximize" | "max" => Ok(Direction::Maximize),
            other => Err(DaqError::Configuration(format!(
                "unknown optimization direction '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug)]
enum Phase {
    Propose,
    Sample {
        point: Vec<f64>,
        since: f64,
        readings: Vec<f64>,
    },
}

/// Drives its knobs toward the optimum of an objective variable.
///
/// Each proposed point is committed, left to settle for `settling_time`, then sampled
/// `samples` times (one reading per iteration) and the average reported to the
/// optimizer. Proposals are clamped to the bounds and, with `max_delta`, to a maximum
/// displacement from the previously commanded point.
#[derive(Debug)]
pub struct Optimize {
    objective: String,
    direction: Direction,
    knobs: Vec<String>,
    bounds: Bounds,
    max_delta: Option<Vec<f64>>,
    samples: usize,
    settling_time: f64,
    optimizer: Box<dyn Optimizer>,
    last: Option<Vec<f64>>,
    phase: Phase,
}

impl Optimize {
    pub fn new<S: Into<String>>(
        objective: impl Into<String>,
        direction: Direction,
        knobs: Vec<(S, (f64, f64))>,
        optimizer: Box<dyn Optimizer>,
    ) -> AppResult<Self> {
        let (knobs, bounds): (Vec<String>, Bounds) =
            knobs.into_iter().map(|(k, b)| (k.into(), b)).unzip();
        check_bounds(&bounds)?;
        Ok(Self {
            objective: objective.into(),
            direction,
            knobs,
            bounds,
            max_delta: None,
            samples: 1,
            settling_time: 0.0,
            optimizer,
            last: None,
            phase: Phase::Propose,
        })
    }

    pub fn with_samples(mut self, samples: usize) -> AppResult<Self> {
        if samples == 0 {
            return Err(DaqError::Configuration("samples must be at least 1".to_string()));
        }
        self.samples = samples;
        Ok(self)
    }

    /// Per-knob maximum displacement per proposal.
    pub fn with_max_delta(mut self, max_delta: Vec<f64>) -> AppResult<Self> {
        if max_delta.len() != self.knobs.len() || max_delta.iter().any(|d| d.is_nan() || *d <= 0.0) {
            return Err(DaqError::Configuration(format!(
                "max delta needs one positive entry per knob ({})",
                self.knobs.len()
            )));
        }
        self.max_delta = Some(max_delta);
        Ok(self)
    }

    /// Experiment seconds to wait after a commit before sampling.
    pub fn with_settling_time(mut self, seconds: f64) -> Self {
        self.settling_time = seconds.max(0.0);
        self
    }

    pub fn knobs(&self) -> impl Iterator<Item = &str> {
        self.knobs.iter().map(String::as_str)
    }

    pub fn objective(&self) -> &str {
        &self.objective
    }

    pub fn best(&self) -> Option<(Vec<f64>, f64)> {
        self.optimizer.best().map(|(x, cost)| match self.direction {
            Direction::Minimize => (x, cost),
            Direction::Maximize => (x, -cost),
        })
    }

    /// Best point found, to leave the knobs at once the window closes.
    pub(super) fn finish(&self) -> Vec<Assignment> {
        match self.optimizer.best() {
            Some((point, _)) => self
                .knobs
                .iter()
                .zip(point)
                .map(|(k, x)| (k.clone(), x.into()))
                .collect(),
            None => {
                warn!(objective = %self.objective, "No optimum found");
                Vec::new()
            }
        }
    }

    fn propose(&mut self, state: &State) -> Vec<Assignment> {
        let mut point = self.optimizer.ask();
        let previous = self.last.clone().or_else(|| {
            self.knobs
                .iter()
                .map(|k| state.value_f64(k))
                .collect::<Option<Vec<f64>>>()
        });
        if let (Some(limits), Some(previous)) = (&self.max_delta, previous) {
            for ((x, from), d) in point.iter_mut().zip(&previous).zip(limits) {
                *x = from + (*x - from).clamp(-d, *d);
            }
        }
        for (x, (lo, hi)) in point.iter_mut().zip(&self.bounds) {
            *x = x.clamp(*lo, *hi);
        }

        debug!(objective = %self.objective, point = ?point, "Proposing");
        self.last = Some(point.clone());
        let assignments = self
            .knobs
            .iter()
            .zip(&point)
            .map(|(k, x)| (k.clone(), (*x).into()))
            .collect();
        self.phase = Phase::Sample {
            point,
            since: state.time,
            readings: Vec::with_capacity(self.samples),
        };
        assignments
    }

    pub(super) fn assign(
        &mut self,
        window: &Window,
        state: &State,
    ) -> AppResult<Option<Vec<Assignment>>> {
        self.optimizer.set_progress(window.progress(state.time));

        let Phase::Sample {
            point,
            since,
            readings,
        } = &mut self.phase
        else {
            return Ok(Some(self.propose(state)));
        };

        if state.time - *since < self.settling_time {
            return Ok(None);
        }
        let Some(value) = state.value(&self.objective) else {
            return Ok(None);
        };
        let reading = value.as_f64().filter(|x| x.is_finite()).ok_or_else(|| {
            warn!(objective = %self.objective, value = %value, "Objective is not finite");
            DaqError::Optimizer {
                routine: String::new(),
                reason: format!("objective '{}' read non-finite value {}", self.objective, value),
            }
        })?;
        readings.push(reading);
        if readings.len() < self.samples {
            return Ok(None);
        }

        let mean = readings.iter().sum::<f64>() / readings.len() as f64;
        let cost = match self.direction {
            Direction::Minimize => mean,
            Direction::Maximize => -mean,
        };
        let point = std::mem::take(point);
        self.optimizer.tell(&point, cost);
        Ok(Some(self.propose(state)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;
    use crate::routine::{DirectSearch, Routine, Trajectory};

    fn objective(x: f64) -> f64 {
        -(x - 2.0).powi(2)
    }

    #[test]
    fn maximizes_simulated_response() {
        let search = DirectSearch::new(vec![(0.0, 5.0)]).unwrap();
        let mut optimize =
            Optimize::new("signal", Direction::Maximize, vec![("k", (0.0, 5.0))], Box::new(search))
                .unwrap()
                .with_samples(2)
                .unwrap();

        let mut knob = 0.0;
        let mut sampled = false;
        for i in 0..400 {
            let state = State::at(
                i as f64,
                [("k", Value::Float(knob)), ("signal", Value::Float(objective(knob)))],
            );
            if let Some(assignments) = optimize.assign(&Window::default(), &state).unwrap() {
                knob = assignments[0].1.as_f64().unwrap();
                sampled = true;
            }
        }
        assert!(sampled);
        let (best, value) = optimize.best().unwrap();
        assert!((best[0] - 2.0).abs() < 1e-2, "{:?}", best);
        assert!(value > -1e-3);
    }

    #[test]
    fn finishing_leaves_knobs_at_best_point() {
        let search = DirectSearch::new(vec![(0.0, 5.0)]).unwrap();
        let optimize =
            Optimize::new("signal", Direction::Maximize, vec![("k", (0.0, 5.0))], Box::new(search))
                .unwrap();
        let mut routine = Routine::new("opt", Trajectory::Optimize(optimize))
            .with_window(Window::new(0.0, 300.0).unwrap());

        let mut knob = 0.0;
        for i in 0..300 {
            let state = State::at(
                i as f64,
                [("k", Value::Float(knob)), ("signal", Value::Float(objective(knob)))],
            );
            if let Some(assignments) = routine.update(&state).unwrap() {
                knob = assignments[0].1.as_f64().unwrap();
            }
        }

        let last = routine.update(&State::at(301.0, [])).unwrap().unwrap();
        assert_eq!(last[0].0, "k");
        let best = last[0].1.as_f64().unwrap();
        assert!((best - 2.0).abs() < 1e-2, "best {}", best);
        assert!(routine.is_terminal());
    }

    #[test]
    fn finishing_without_samples_assigns_nothing() {
        let search = DirectSearch::new(vec![(0.0, 1.0)]).unwrap();
        let optimize =
            Optimize::new("signal", Direction::Minimize, vec![("k", (0.0, 1.0))], Box::new(search))
                .unwrap();
        let mut routine = Routine::new("opt", Trajectory::Optimize(optimize))
            .with_window(Window::new(5.0, 6.0).unwrap());
        assert_eq!(routine.update(&State::at(7.0, [])).unwrap(), None);
        assert!(routine.is_terminal());
    }

    #[test]
    fn max_delta_limits_first_step_from_snapshot() {
        let search = DirectSearch::new(vec![(0.0, 10.0)]).unwrap();
        let mut optimize =
            Optimize::new("signal", Direction::Minimize, vec![("k", (0.0, 10.0))], Box::new(search))
                .unwrap()
                .with_max_delta(vec![1.0])
                .unwrap();
        let state = State::at(0.0, [("k", Value::Float(0.0))]);
        let assignments = optimize.assign(&Window::default(), &state).unwrap().unwrap();
        assert_eq!(assignments, vec![("k".to_string(), Value::Float(1.0))]);
    }

    #[test]
    fn settling_time_delays_sampling() {
        let search = DirectSearch::new(vec![(0.0, 1.0)]).unwrap();
        let mut optimize =
            Optimize::new("signal", Direction::Minimize, vec![("k", (0.0, 1.0))], Box::new(search))
                .unwrap()
                .with_settling_time(2.0);
        let window = Window::default();
        let at = |t: f64| State::at(t, [("signal", Value::Float(1.0))]);
        assert!(optimize.assign(&window, &at(0.0)).unwrap().is_some());
        assert!(optimize.assign(&window, &at(1.0)).unwrap().is_none());
        assert!(optimize.assign(&window, &at(2.0)).unwrap().is_some());
    }

    #[test]
    fn non_finite_objective_pauses_routine() {
        let search = DirectSearch::new(vec![(0.0, 1.0)]).unwrap();
        let optimize =
            Optimize::new("signal", Direction::Minimize, vec![("k", (0.0, 1.0))], Box::new(search))
                .unwrap();
        let mut routine = Routine::new("opt", Trajectory::Optimize(optimize));

        assert!(routine.update(&State::at(0.0, [])).unwrap().is_some());
        let bad = State::at(1.0, [("signal", Value::Float(f64::NAN))]);
        match routine.update(&bad) {
            Err(DaqError::Optimizer { routine, .. }) => assert_eq!(routine, "opt"),
            other => panic!("expected optimizer error, got {:?}", other),
        }
        assert!(routine.is_terminal());
        let good = State::at(2.0, [("signal", Value::Float(0.5))]);
        assert_eq!(routine.update(&good).unwrap(), None);
    }
}
