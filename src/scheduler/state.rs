//! Published experiment snapshots.

use crate::core::Value;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Scheduler lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    /// Routines, commits and refreshes all run
    Running,
    /// Routines paused; variables keep refreshing
    Holding,
    /// No variable activity at all
    Stopped,
    /// Final; no iteration starts after this
    Terminated,
}

impl Lifecycle {
    /// Whether the experiment clock advances in this state.
    pub fn clock_runs(self) -> bool {
        self == Lifecycle::Running
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Lifecycle::Running => "running",
            Lifecycle::Holding => "holding",
            Lifecycle::Stopped => "stopped",
            Lifecycle::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// An error recorded against one iteration instead of aborting the run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    /// Variable, routine or alarm name
    pub source: String,
    pub message: String,
}

impl Diagnostic {
    pub fn new(source: impl Into<String>, message: impl ToString) -> Self {
        Self {
            source: source.into(),
            message: message.to_string(),
        }
    }
}

/// Immutable per-iteration snapshot: experiment time, wall-clock timestamp and the
/// latest value of every variable, in declaration order.
#[derive(Debug, Clone, Serialize)]
pub struct State {
    pub run_id: Uuid,
    pub iteration: u64,
    /// Experiment seconds; does not advance while holding or stopped
    pub time: f64,
    pub timestamp: DateTime<Utc>,
    pub lifecycle: Lifecycle,
    pub values: Vec<(String, Option<Value>)>,
    pub diagnostics: Vec<Diagnostic>,
}

impl State {
    /// Snapshot before the first iteration: every value unknown.
    pub fn initial<'a>(run_id: Uuid, names: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            run_id,
            iteration: 0,
            time: 0.0,
            timestamp: Utc::now(),
            lifecycle: Lifecycle::Running,
            values: names.into_iter().map(|n| (n.to_string(), None)).collect(),
            diagnostics: Vec::new(),
        }
    }

    /// Free-standing snapshot at `time` with the given values.
    pub fn at<'a>(time: f64, values: impl IntoIterator<Item = (&'a str, Value)>) -> Self {
        Self {
            run_id: Uuid::nil(),
            iteration: 0,
            time,
            timestamp: Utc::now(),
            lifecycle: Lifecycle::Running,
            values: values
                .into_iter()
                .map(|(name, value)| (name.to_string(), Some(value)))
                .collect(),
            diagnostics: Vec::new(),
        }
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.as_ref())
    }

    pub fn value_f64(&self, name: &str) -> Option<f64> {
        self.value(name).and_then(Value::as_f64)
    }

    pub fn diagnostics_for<'a>(&'a self, source: &'a str) -> impl Iterator<Item = &'a Diagnostic> {
        self.diagnostics.iter().filter(move |d| d.source == source)
    }

    /// Flat record for sinks: `time`, `timestamp`, then one field per variable.
    pub fn to_record(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut record = serde_json::Map::new();
        record.insert("time".into(), serde_json::json!(self.time));
        record.insert("timestamp".into(), serde_json::json!(self.timestamp.to_rfc3339()));
        for (name, value) in &self.values {
            record.insert(
                name.clone(),
                value.as_ref().map(Value::to_json).unwrap_or(serde_json::Value::Null),
            );
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_and_record() {
        let state = State::at(1.5, [("v", Value::Float(2.0)), ("mode", Value::from("fast"))]);
        assert_eq!(state.value_f64("v"), Some(2.0));
        assert_eq!(state.value("missing"), None);

        let record = state.to_record();
        assert_eq!(record["time"], 1.5);
        assert_eq!(record["mode"], "fast");
        assert_eq!(record.len(), 4);
    }

    #[test]
    fn initial_values_are_unknown() {
        let state = State::initial(Uuid::new_v4(), ["a", "b"]);
        assert_eq!(state.values.len(), 2);
        assert!(state.value("a").is_none());
        assert!(Lifecycle::Running.clock_runs());
        assert!(!Lifecycle::Holding.clock_runs());
    }
}
