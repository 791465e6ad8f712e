use super::{Assignment, Setpoint};
use crate::error::{AppResult, DaqError};
use crate::scheduler::State;
use std::collections::{HashMap, HashSet};

fn unique_knobs<'a>(what: &str, knobs: impl Iterator<Item = &'a str>) -> AppResult<()> {
    let mut seen = HashSet::new();
    let mut any = false;
    for knob in knobs {
        any = true;
        if !seen.insert(knob) {
            return Err(DaqError::Configuration(format!(
                "{}: knob '{}' listed twice",
                what, knob
            )));
        }
    }
    if !any {
        return Err(DaqError::Configuration(format!("{}: no knobs", what)));
    }
    Ok(())
}

/// Holds one fixed value per knob for the whole window.
#[derive(Debug, Clone)]
pub struct Set {
    values: Vec<(String, Setpoint)>,
}

impl Set {
    pub fn new<I, S>(values: I) -> AppResult<Self>
    where
        I: IntoIterator<Item = (S, Setpoint)>,
        S: Into<String>,
    {
        let values: Vec<(String, Setpoint)> =
            values.into_iter().map(|(k, v)| (k.into(), v)).collect();
        unique_knobs("set", values.iter().map(|(k, _)| k.as_str()))?;
        Ok(Self { values })
    }

    pub fn knobs(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(k, _)| k.as_str())
    }

    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.values.iter().filter_map(|(_, v)| match v {
            Setpoint::Variable(name) => Some(name.as_str()),
            Setpoint::Literal(_) => None,
        })
    }

    pub(super) fn assign(&self, state: &State) -> AppResult<Vec<Assignment>> {
        self.values
            .iter()
            .map(|(knob, setpoint)| Ok((knob.clone(), setpoint.resolve(state)?)))
            .collect()
    }
}

#[derive(Debug, Clone)]
struct RampTarget {
    knob: String,
    target: Setpoint,
    /// Units per experiment second
    rate: f64,
}

/// Moves each knob toward its target at a bounded rate.
///
/// The ramp starts from the knob's snapshot value; a knob with no known value jumps
/// straight to the target.
#[derive(Debug, Clone)]
pub struct Ramp {
    targets: Vec<RampTarget>,
    position: HashMap<String, f64>,
    last_time: Option<f64>,
}

impl Ramp {
    pub fn new<I, S>(targets: I) -> AppResult<Self>
    where
        I: IntoIterator<Item = (S, Setpoint, f64)>,
        S: Into<String>,
    {
        let targets: Vec<RampTarget> = targets
            .into_iter()
            .map(|(knob, target, rate)| RampTarget {
                knob: knob.into(),
                target,
                rate,
            })
            .collect();
        unique_knobs("ramp", targets.iter().map(|t| t.knob.as_str()))?;
        if let Some(bad) = targets.iter().find(|t| t.rate <= 0.0 || !t.rate.is_finite()) {
            return Err(DaqError::Configuration(format!(
                "ramp: rate for '{}' must be positive, got {}",
                bad.knob, bad.rate
            )));
        }
        Ok(Self {
            targets,
            position: HashMap::new(),
            last_time: None,
        })
    }

    pub fn knobs(&self) -> impl Iterator<Item = &str> {
        self.targets.iter().map(|t| t.knob.as_str())
    }

    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.targets.iter().filter_map(|t| match &t.target {
            Setpoint::Variable(name) => Some(name.as_str()),
            Setpoint::Literal(_) => None,
        })
    }

    /// Forgets the ramp position so the next pass starts from the snapshot again.
    pub(super) fn restart(&mut self) {
        self.position.clear();
        self.last_time = None;
    }

    pub(super) fn assign(&mut self, state: &State) -> AppResult<Vec<Assignment>> {
        let dt = self
            .last_time
            .map(|last| (state.time - last).max(0.0))
            .unwrap_or(0.0);
        self.last_time = Some(state.time);

        let mut assignments = Vec::with_capacity(self.targets.len());
        for ramp in &self.targets {
            let target = ramp.target.resolve_f64(state)?;
            let current = self
                .position
                .get(&ramp.knob)
                .copied()
                .or_else(|| state.value_f64(&ramp.knob))
                .unwrap_or(target);
            let step = ramp.rate * dt;
            let next = if (target - current).abs() <= step {
                target
            } else {
                current + step * (target - current).signum()
            };
            self.position.insert(ramp.knob.clone(), next);
            assignments.push((ramp.knob.clone(), next.into()));
        }
        Ok(assignments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;

    #[test]
    fn set_resolves_literals_and_variables() {
        let set = Set::new([
            ("a", Setpoint::from(1.0)),
            ("b", Setpoint::variable("target")),
        ])
        .unwrap();
        let state = State::at(0.0, [("target", Value::Integer(4))]);
        assert_eq!(
            set.assign(&state).unwrap(),
            vec![
                ("a".to_string(), Value::Float(1.0)),
                ("b".to_string(), Value::Integer(4))
            ]
        );
        assert_eq!(set.references().collect::<Vec<_>>(), vec!["target"]);
        assert!(Set::new([("a", Setpoint::from(1.0)), ("a", Setpoint::from(2.0))]).is_err());
    }

    #[test]
    fn ramp_limits_rate() {
        let mut ramp = Ramp::new([("v", Setpoint::from(10.0), 2.0)]).unwrap();
        let first = ramp.assign(&State::at(0.0, [("v", Value::Float(0.0))])).unwrap();
        assert_eq!(first[0].1, Value::Float(0.0));
        let second = ramp.assign(&State::at(1.5, [("v", Value::Float(0.0))])).unwrap();
        assert_eq!(second[0].1, Value::Float(3.0));
        let done = ramp.assign(&State::at(10.0, [])).unwrap();
        assert_eq!(done[0].1, Value::Float(10.0));
        assert!(Ramp::new([("v", Setpoint::from(1.0), 0.0)]).is_err());
    }
}
