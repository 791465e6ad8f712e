use super::{check_columns, Assignment, Setpoint};
use crate::error::{AppResult, DaqError};
use crate::scheduler::State;

// Absorbs float error in elapsed / interval at exact multiples.
const STEP_EPSILON: f64 = 1e-9;

/// Ordered value-sets, one step per `interval` after entering the window. The final
/// entry is held once the list is exhausted.
#[derive(Debug, Clone)]
pub struct Sequence {
    interval: f64,
    steps: usize,
    columns: Vec<(String, Vec<Setpoint>)>,
    entered: Option<f64>,
}

impl Sequence {
    pub fn new<I, S>(interval: f64, columns: I) -> AppResult<Self>
    where
        I: IntoIterator<Item = (S, Vec<Setpoint>)>,
        S: Into<String>,
    {
        if interval <= 0.0 || !interval.is_finite() {
            return Err(DaqError::Configuration(format!(
                "sequence: step interval must be positive, got {}",
                interval
            )));
        }
        let columns: Vec<(String, Vec<Setpoint>)> = columns
            .into_iter()
            .map(|(knob, values)| (knob.into(), values))
            .collect();
        let steps = columns.first().map(|(_, v)| v.len()).unwrap_or(0);
        check_columns("sequence", steps, &columns)?;
        Ok(Self {
            interval,
            steps,
            columns,
            entered: None,
        })
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

    pub fn len(&self) -> usize {
        self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps == 0
    }

    /// Index of the entry active at `t`.
    pub fn step_at(&mut self, t: f64) -> usize {
        let entered = *self.entered.get_or_insert(t);
        let elapsed = (t - entered).max(0.0);
        let index = (elapsed / self.interval + STEP_EPSILON).floor() as usize;
        index.min(self.steps - 1)
    }

    pub(super) fn restart(&mut self) {
        self.entered = None;
    }

    /// Final entry of every column.
    pub(super) fn finish(&self, state: &State) -> AppResult<Vec<Assignment>> {
        self.columns
            .iter()
            .filter_map(|(knob, values)| values.last().map(|last| (knob, last)))
            .map(|(knob, last)| Ok((knob.clone(), last.resolve(state)?)))
            .collect()
    }

    pub(super) fn assign(&mut self, state: &State) -> AppResult<Vec<Assignment>> {
        let index = self.step_at(state.time);
        self.columns
            .iter()
            .map(|(knob, values)| Ok((knob.clone(), values[index].resolve(state)?)))
            .collect()
    }
}
