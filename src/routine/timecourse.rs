use super::{check_columns, Assignment, Setpoint};
use crate::error::{AppResult, DaqError};
use crate::scheduler::State;

/// Piecewise-linear waypoints per knob. Before the first and after the last waypoint the
/// nearest boundary value is held.
#[derive(Debug, Clone)]
pub struct Timecourse {
    times: Vec<f64>,
    columns: Vec<(String, Vec<Setpoint>)>,
}

impl Timecourse {
    /// `times` in experiment seconds, strictly increasing; one value column per knob.
    pub fn new<I, S>(times: Vec<f64>, columns: I) -> AppResult<Self>
    where
        I: IntoIterator<Item = (S, Vec<Setpoint>)>,
        S: Into<String>,
    {
        let columns: Vec<(String, Vec<Setpoint>)> = columns
            .into_iter()
            .map(|(knob, values)| (knob.into(), values))
            .collect();
        check_columns("timecourse", times.len(), &columns)?;

        if times.iter().any(|t| !t.is_finite()) {
            return Err(DaqError::Configuration(
                "timecourse: waypoint times must be finite".to_string(),
            ));
        }
        if times.windows(2).any(|w| w[1] <= w[0]) {
            return Err(DaqError::Configuration(
                "timecourse: waypoint times must be strictly increasing".to_string(),
            ));
        }
        for (knob, values) in &columns {
            for value in values {
                if let Setpoint::Literal(literal) = value {
                    if literal.as_f64().map_or(true, |x| !x.is_finite()) {
                        return Err(DaqError::Configuration(format!(
                            "timecourse: waypoint '{}' for '{}' is not a finite number",
                            literal, knob
                        )));
                    }
                }
            }
        }
        Ok(Self { times, columns })
    }

    pub fn knobs(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(k, _)| k.as_str())
    }

    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().flat_map(|(_, values)| {
            values.iter().filter_map(|v| match v {
                Setpoint::Variable(name) => Some(name.as_str()),
                Setpoint::Literal(_) => None,
            })
        })
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    fn interpolate(&self, values: &[Setpoint], t: f64, state: &State) -> AppResult<f64> {
        let last = self.times.len() - 1;
        if t <= self.times[0] {
            return values[0].resolve_f64(state);
        }
        if t >= self.times[last] {
            return values[last].resolve_f64(state);
        }
        let upper = self.times.partition_point(|x| *x <= t);
        let lower = upper - 1;
        let (t0, t1) = (self.times[lower], self.times[upper]);
        let v0 = values[lower].resolve_f64(state)?;
        let v1 = values[upper].resolve_f64(state)?;
        Ok(v0 + (v1 - v0) * (t - t0) / (t1 - t0))
    }

    /// Last waypoint of every knob.
    pub(super) fn finish(&self, state: &State) -> AppResult<Vec<Assignment>> {
        self.columns
            .iter()
            .filter_map(|(knob, values)| values.last().map(|last| (knob, last)))
            .map(|(knob, last)| Ok((knob.clone(), last.resolve_f64(state)?.into())))
            .collect()
    }

    pub(super) fn assign(&self, state: &State) -> AppResult<Vec<Assignment>> {
        self.columns
            .iter()
            .map(|(knob, values)| {
                let value = self.interpolate(values, state.time, state)?;
                Ok((knob.clone(), value.into()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;

    fn column(values: &[f64]) -> Vec<Setpoint> {
        values.iter().copied().map(Setpoint::from).collect()
    }

    fn value_at(timecourse: &Timecourse, t: f64) -> f64 {
        timecourse.assign(&State::at(t, [])).unwrap()[0]
            .1
            .as_f64()
            .unwrap()
    }

    #[test]
    fn interpolates_and_holds_boundaries() {
        let tc = Timecourse::new(vec![3.0, 5.0], [("k", column(&[0.0, 1.4]))]).unwrap();
        assert_eq!(value_at(&tc, 4.0), 0.7);
        assert_eq!(value_at(&tc, 0.0), 0.0);
        assert_eq!(value_at(&tc, 3.0), 0.0);
        assert_eq!(value_at(&tc, 5.0), 1.4);
        assert_eq!(value_at(&tc, 100.0), 1.4);
    }

    #[test]
    fn multiple_segments() {
        let tc = Timecourse::new(vec![0.0, 10.0, 20.0], [("k", column(&[0.0, 10.0, -10.0]))])
            .unwrap();
        assert_eq!(value_at(&tc, 2.5), 2.5);
        assert_eq!(value_at(&tc, 10.0), 10.0);
        assert_eq!(value_at(&tc, 15.0), 0.0);
    }

    #[test]
    fn waypoint_may_reference_variable() {
        let tc = Timecourse::new(
            vec![0.0, 2.0],
            [("k", vec![Setpoint::from(0.0), Setpoint::variable("goal")])],
        )
        .unwrap();
        let state = State::at(1.0, [("goal", Value::Float(4.0))]);
        assert_eq!(tc.assign(&state).unwrap()[0].1, Value::Float(2.0));
    }

    #[test]
    fn rejects_malformed_tables() {
        assert!(Timecourse::new(vec![1.0, 1.0], [("k", column(&[0.0, 1.0]))]).is_err());
        assert!(Timecourse::new(vec![1.0, 2.0], [("k", column(&[0.0]))]).is_err());
        assert!(Timecourse::new(Vec::new(), [("k", column(&[]))]).is_err());
        assert!(Timecourse::new(
            vec![0.0, 1.0],
            [("k", vec![Setpoint::from(0.0), Setpoint::from(Value::from("high"))])]
        )
        .is_err());
    }
}
