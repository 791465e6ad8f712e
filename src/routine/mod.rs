//! Time-windowed knob trajectories
//!
//! Every [`Routine`] owns a set of target knobs and a `[start, end]` window in experiment
//! seconds. The scheduler calls [`Routine::update`] once per iteration with the
//! pre-iteration [`State`]; a routine returns the assignments to commit or `None`.
//!
//! Outside its window, while its optional `enable` variable reads false, or once it has
//! gone inert, a routine issues nothing. Passing `end` makes it inert for good; on that
//! iteration Timecourse and Sequence routines assign their final entries and optimizing
//! routines their best point. A routine started on enable arms its window when the enable
//! variable turns true and disarms it again if the variable drops before the end.

pub mod optimize;
pub mod optimizer;
pub mod sequence;
pub mod set;
#[cfg(feature = "storage_csv")]
pub mod table;
pub mod timecourse;

pub use optimize::{Direction, Optimize};
pub use optimizer::{Bayesian, DirectSearch, Optimizer};
pub use sequence::Sequence;
pub use set::{Ramp, Set};
pub use timecourse::Timecourse;

use crate::core::Value;
use crate::error::{AppResult, DaqError};
use crate::scheduler::State;
use tracing::{debug, info, warn};

/// Knob name and value to commit.
pub type Assignment = (String, Value);

/// Inclusive activity window in experiment seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Window {
    pub start: f64,
    pub end: f64,
}

impl Default for Window {
    fn default() -> Self {
        Self {
            start: 0.0,
            end: f64::INFINITY,
        }
    }
}

impl Window {
    pub fn new(start: f64, end: f64) -> AppResult<Self> {
        if start.is_nan() || end.is_nan() || start > end {
            return Err(DaqError::Configuration(format!(
                "invalid routine window [{}, {}]",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// Window of `duration` seconds from `start`.
    pub fn lasting(start: f64, duration: f64) -> AppResult<Self> {
        Self::new(start, start + duration)
    }

    /// Parses human-readable bounds such as `"2 minutes"` or `"inf"`.
    pub fn parse(start: &str, end: &str) -> AppResult<Self> {
        Self::new(crate::config::parse_time(start)?, crate::config::parse_time(end)?)
    }

    pub fn contains(&self, t: f64) -> bool {
        self.start <= t && t <= self.end
    }

    /// Fraction of the window elapsed at `t`, or 0 for open-ended windows.
    pub fn progress(&self, t: f64) -> f64 {
        if self.end.is_finite() && self.end > self.start {
            ((t - self.start) / (self.end - self.start)).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

/// A literal value or the name of a variable whose snapshot value is used.
#[derive(Debug, Clone, PartialEq)]
pub enum Setpoint {
    Literal(Value),
    Variable(String),
}

impl Setpoint {
    pub fn variable(name: impl Into<String>) -> Self {
        Setpoint::Variable(name.into())
    }

    pub fn resolve(&self, state: &State) -> AppResult<Value> {
        match self {
            Setpoint::Literal(value) => Ok(value.clone()),
            Setpoint::Variable(name) => state
                .value(name)
                .cloned()
                .ok_or_else(|| DaqError::NoValue(name.clone())),
        }
    }

    pub fn resolve_f64(&self, state: &State) -> AppResult<f64> {
        let value = self.resolve(state)?;
        value
            .as_f64()
            .ok_or_else(|| DaqError::Type(format!("setpoint '{}' is not numeric", value)))
    }
}

impl From<Value> for Setpoint {
    fn from(value: Value) -> Self {
        Setpoint::Literal(value)
    }
}

impl From<f64> for Setpoint {
    fn from(value: f64) -> Self {
        Setpoint::Literal(Value::Float(value))
    }
}

impl From<i64> for Setpoint {
    fn from(value: i64) -> Self {
        Setpoint::Literal(Value::Integer(value))
    }
}

impl From<bool> for Setpoint {
    fn from(value: bool) -> Self {
        Setpoint::Literal(Value::Boolean(value))
    }
}

/// Progress of a routine through its window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Before `start`
    Waiting,
    Active,
    /// Stopped issuing assignments after an objective failure
    Paused,
    /// Past `end`
    Finished,
}

/// Trajectory-specific behaviour behind [`Routine`].
#[derive(Debug)]
pub enum Trajectory {
    Set(Set),
    Ramp(Ramp),
    Timecourse(Timecourse),
    Sequence(Sequence),
    Optimize(Optimize),
}

impl Trajectory {
    fn knobs(&self) -> Vec<&str> {
        match self {
            Trajectory::Set(t) => t.knobs().collect(),
            Trajectory::Ramp(t) => t.knobs().collect(),
            Trajectory::Timecourse(t) => t.knobs().collect(),
            Trajectory::Sequence(t) => t.knobs().collect(),
            Trajectory::Optimize(t) => t.knobs().collect(),
        }
    }

    fn variables(&self) -> Vec<&str> {
        match self {
            Trajectory::Set(t) => t.references().collect(),
            Trajectory::Ramp(t) => t.references().collect(),
            Trajectory::Timecourse(t) => t.references().collect(),
            Trajectory::Sequence(t) => t.references().collect(),
            Trajectory::Optimize(t) => vec![t.objective()],
        }
    }

    fn assign(&mut self, window: &Window, state: &State) -> AppResult<Option<Vec<Assignment>>> {
        match self {
            Trajectory::Set(t) => t.assign(state).map(Some),
            Trajectory::Ramp(t) => t.assign(state).map(Some),
            Trajectory::Timecourse(t) => t.assign(state).map(Some),
            Trajectory::Sequence(t) => t.assign(state).map(Some),
            Trajectory::Optimize(t) => t.assign(window, state),
        }
    }

    fn finish(&self, state: &State) -> AppResult<Vec<Assignment>> {
        match self {
            Trajectory::Set(_) | Trajectory::Ramp(_) => Ok(Vec::new()),
            Trajectory::Timecourse(t) => t.finish(state),
            Trajectory::Sequence(t) => t.finish(state),
            Trajectory::Optimize(t) => Ok(t.finish()),
        }
    }

    fn restart(&mut self) {
        match self {
            Trajectory::Ramp(t) => t.restart(),
            Trajectory::Sequence(t) => t.restart(),
            Trajectory::Set(_) | Trajectory::Timecourse(_) | Trajectory::Optimize(_) => {}
        }
    }
}

// Window of a routine started on enable that has not been armed yet.
const UNARMED: Window = Window {
    start: f64::INFINITY,
    end: f64::INFINITY,
};

/// Named trajectory with a window and an optional enable gate.
#[derive(Debug)]
pub struct Routine {
    name: String,
    window: Window,
    enable: Option<String>,
    /// Window length when the window opens on enable
    on_enable: Option<f64>,
    status: Status,
    trajectory: Trajectory,
}

impl Routine {
    pub fn new(name: impl Into<String>, trajectory: Trajectory) -> Self {
        Self {
            name: name.into(),
            window: Window::default(),
            enable: None,
            on_enable: None,
            status: Status::Waiting,
            trajectory,
        }
    }

    pub fn with_window(mut self, window: Window) -> Self {
        self.window = window;
        self
    }

    /// Gates the routine on a boolean-like variable.
    pub fn with_enable(mut self, variable: impl Into<String>) -> Self {
        self.enable = Some(variable.into());
        self
    }

    /// Opens the window for `duration` seconds each time `variable` turns true.
    pub fn on_enable(mut self, variable: impl Into<String>, duration: f64) -> AppResult<Self> {
        if duration.is_nan() || duration <= 0.0 {
            return Err(DaqError::Configuration(format!(
                "routine '{}': duration must be positive, got {}",
                self.name, duration
            )));
        }
        self.enable = Some(variable.into());
        self.on_enable = Some(duration);
        self.window = UNARMED;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn window(&self) -> Window {
        self.window
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn trajectory(&self) -> &Trajectory {
        &self.trajectory
    }

    /// Knobs this routine assigns.
    pub fn knobs(&self) -> Vec<&str> {
        self.trajectory.knobs()
    }

    /// Every variable name the routine reads or writes, for build-time checks.
    pub fn referenced_variables(&self) -> Vec<&str> {
        let mut names = self.trajectory.knobs();
        names.extend(self.trajectory.variables());
        names.extend(self.enable.as_deref());
        names
    }

    /// Inert routines never assign again.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, Status::Paused | Status::Finished)
    }

    fn enabled(&self, state: &State) -> bool {
        match &self.enable {
            Some(variable) => state
                .value(variable)
                .and_then(Value::as_bool)
                .unwrap_or(false),
            None => true,
        }
    }

    /// Computes this iteration's assignments from the pre-iteration snapshot.
    ///
    /// Errors are routine-local: an objective failure pauses an optimizing routine for
    /// the rest of the run and is reported once.
    pub fn update(&mut self, state: &State) -> AppResult<Option<Vec<Assignment>>> {
        if self.is_terminal() {
            return Ok(None);
        }
        let t = state.time;
        let enabled = self.enabled(state);
        if let Some(duration) = self.on_enable {
            if !enabled {
                if self.status == Status::Active {
                    info!(routine = %self.name, time = t, "Routine disarmed");
                    self.status = Status::Waiting;
                    self.trajectory.restart();
                }
                self.window = UNARMED;
                return Ok(None);
            }
            if self.window == UNARMED {
                self.window = Window::lasting(t, duration)?;
                debug!(routine = %self.name, start = t, end = self.window.end, "Routine armed");
            }
        }
        if t > self.window.end {
            self.status = Status::Finished;
            info!(routine = %self.name, time = t, "Routine finished");
            if !enabled {
                return Ok(None);
            }
            let last = self.trajectory.finish(state)?;
            return Ok((!last.is_empty()).then_some(last));
        }
        if t < self.window.start {
            return Ok(None);
        }
        if self.status == Status::Waiting {
            self.status = Status::Active;
            info!(routine = %self.name, time = t, "Routine active");
        }
        if !enabled {
            return Ok(None);
        }

        match self.trajectory.assign(&self.window, state) {
            Ok(assignments) => {
                if let Some(assignments) = &assignments {
                    debug!(routine = %self.name, count = assignments.len(), "Assignments");
                }
                Ok(assignments)
            }
            Err(DaqError::Optimizer { reason, .. }) => {
                self.status = Status::Paused;
                warn!(routine = %self.name, reason = %reason, "Routine paused");
                Err(DaqError::Optimizer {
                    routine: self.name.clone(),
                    reason,
                })
            }
            Err(err) => Err(err),
        }
    }
}

/// Checks a waypoint or step table: same length for every column, at least one row.
pub(crate) fn check_columns<T>(
    what: &str,
    rows: usize,
    columns: &[(String, Vec<T>)],
) -> AppResult<()> {
    if rows == 0 {
        return Err(DaqError::Configuration(format!("{}: table is empty", what)));
    }
    if columns.is_empty() {
        return Err(DaqError::Configuration(format!("{}: no knobs", what)));
    }
    for (knob, values) in columns {
        if values.len() != rows {
            return Err(DaqError::Configuration(format!(
                "{}: knob '{}' has {} entries, expected {}",
                what,
                knob,
                values.len(),
                rows
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_routine() -> Routine {
        Routine::new("hold_v", Trajectory::Set(Set::new([("v", Setpoint::from(1.0))]).unwrap()))
            .with_window(Window::new(2.0, 4.0).unwrap())
    }

    #[test]
    fn silent_outside_window_and_inert_after_end() {
        let mut routine = set_routine();
        assert_eq!(routine.update(&State::at(1.0, [])).unwrap(), None);
        assert_eq!(routine.status(), Status::Waiting);

        let assignments = routine.update(&State::at(3.0, [])).unwrap().unwrap();
        assert_eq!(assignments, vec![("v".to_string(), Value::Float(1.0))]);

        assert_eq!(routine.update(&State::at(4.5, [])).unwrap(), None);
        assert!(routine.is_terminal());
        assert_eq!(routine.update(&State::at(3.0, [])).unwrap(), None);
    }

    #[test]
    fn enable_variable_gates_assignments() {
        let mut routine = set_routine().with_enable("go");
        let off = State::at(3.0, [("go", Value::Boolean(false))]);
        let on = State::at(3.0, [("go", Value::Toggle(crate::core::Toggle::On))]);
        assert_eq!(routine.update(&off).unwrap(), None);
        assert!(routine.update(&on).unwrap().is_some());
        assert_eq!(routine.update(&State::at(3.0, [])).unwrap(), None);
        assert_eq!(routine.referenced_variables(), vec!["v", "go"]);
    }

    fn timecourse_routine() -> Routine {
        let timecourse = Timecourse::new(
            vec![0.0, 1.0],
            [("k", vec![Setpoint::from(0.0), Setpoint::from(1.0)])],
        )
        .unwrap();
        Routine::new("ramp_k", Trajectory::Timecourse(timecourse))
            .with_window(Window::new(0.0, 0.5).unwrap())
    }

    #[test]
    fn timecourse_assigns_final_waypoint_when_finished() {
        let mut routine = timecourse_routine();
        let midway = routine.update(&State::at(0.25, [])).unwrap().unwrap();
        assert_eq!(midway[0].1.as_f64(), Some(0.25));

        let last = routine.update(&State::at(0.6, [])).unwrap().unwrap();
        assert_eq!(last, vec![("k".to_string(), Value::Float(1.0))]);
        assert_eq!(routine.status(), Status::Finished);
        assert_eq!(routine.update(&State::at(0.7, [])).unwrap(), None);
    }

    #[test]
    fn sequence_assigns_final_entry_when_finished() {
        let steps = vec![Setpoint::from(1.0), Setpoint::from(2.0), Setpoint::variable("top")];
        let mut routine = Routine::new(
            "steps",
            Trajectory::Sequence(Sequence::new(10.0, [("k", steps)]).unwrap()),
        )
        .with_window(Window::new(0.0, 5.0).unwrap());

        let first = routine.update(&State::at(1.0, [])).unwrap().unwrap();
        assert_eq!(first[0].1, Value::Float(1.0));
        let last = routine
            .update(&State::at(6.0, [("top", Value::Integer(7))]))
            .unwrap()
            .unwrap();
        assert_eq!(last, vec![("k".to_string(), Value::Integer(7))]);
        assert!(routine.is_terminal());
    }

    #[test]
    fn set_issues_nothing_when_finished() {
        let mut routine = set_routine();
        assert!(routine.update(&State::at(3.0, [])).unwrap().is_some());
        assert_eq!(routine.update(&State::at(5.0, [])).unwrap(), None);
        assert_eq!(routine.status(), Status::Finished);
    }

    #[test]
    fn window_opens_on_enable_and_rearms() {
        let steps = vec![Setpoint::from(1.0), Setpoint::from(2.0)];
        let mut routine = Routine::new(
            "pulse",
            Trajectory::Sequence(Sequence::new(1.0, [("k", steps)]).unwrap()),
        )
        .on_enable("go", 3.0)
        .unwrap();
        let at = |t: f64, go: bool| State::at(t, [("go", Value::Boolean(go))]);

        assert_eq!(routine.update(&at(10.0, false)).unwrap(), None);
        assert_eq!(routine.status(), Status::Waiting);

        let first = routine.update(&at(20.0, true)).unwrap().unwrap();
        assert_eq!(first[0].1, Value::Float(1.0));
        assert_eq!(routine.window(), Window::new(20.0, 23.0).unwrap());
        let second = routine.update(&at(21.0, true)).unwrap().unwrap();
        assert_eq!(second[0].1, Value::Float(2.0));

        // dropping the enable disarms; re-enabling restarts from the first entry
        assert_eq!(routine.update(&at(22.0, false)).unwrap(), None);
        assert_eq!(routine.status(), Status::Waiting);
        let restarted = routine.update(&at(30.0, true)).unwrap().unwrap();
        assert_eq!(restarted[0].1, Value::Float(1.0));
        assert_eq!(routine.window().start, 30.0);

        let last = routine.update(&at(33.5, true)).unwrap().unwrap();
        assert_eq!(last[0].1, Value::Float(2.0));
        assert!(routine.is_terminal());
        assert!(Routine::new("bad", Trajectory::Set(Set::new([("k", Setpoint::from(1.0))]).unwrap()))
            .on_enable("go", 0.0)
            .is_err());
    }

    #[test]
    fn window_parsing_and_progress() {
        let window = Window::parse("1 minute", "3 minutes").unwrap();
        assert_eq!(window.start, 60.0);
        assert_eq!(window.progress(120.0), 0.5);
        assert_eq!(Window::default().progress(1e6), 0.0);
        assert!(Window::new(5.0, 1.0).is_err());
        assert_eq!(Window::lasting(2.0, 3.0).unwrap(), Window::new(2.0, 5.0).unwrap());
    }

    #[test]
    fn setpoint_reads_variable_from_snapshot() {
        let state = State::at(0.0, [("target", Value::Float(2.5))]);
        assert_eq!(Setpoint::variable("target").resolve_f64(&state).unwrap(), 2.5);
        assert!(matches!(
            Setpoint::variable("missing").resolve(&state),
            Err(DaqError::NoValue(_))
        ));
    }
}
