//! Edge-triggered safety conditions.
//!
//! An [`Alarm`] evaluates a boolean formula against the latest snapshot each iteration.
//! Only transitions are reported: the protocol is dispatched once per false→true edge,
//! however many iterations the condition stays true.

use crate::core::Value;
use crate::error::{AppResult, DaqError};
use crate::scheduler::State;
use crate::variable::Formula;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

/// What the scheduler does when an alarm triggers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Protocol {
    /// Record only
    None,
    /// Pause routines, keep refreshing; resume when cleared
    Hold,
    /// Pause all variable activity; resume when cleared
    Stop,
    /// Like `Stop`, but only an explicit resume continues the run
    Check,
    /// End the run, optionally starting a follow-up experiment
    Terminate { follow_up: Option<String> },
}

impl FromStr for Protocol {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Ok(match s.to_ascii_lowercase().as_str() {
            "" => {
                return Err(DaqError::Configuration("empty alarm protocol".to_string()));
            }
            "none" => Protocol::None,
            "hold" => Protocol::Hold,
            "stop" => Protocol::Stop,
            "check" => Protocol::Check,
            "terminate" => Protocol::Terminate { follow_up: None },
            // a bare runcard path
            _ => Protocol::Terminate {
                follow_up: Some(s.to_string()),
            },
        })
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::None => f.write_str("none"),
            Protocol::Hold => f.write_str("hold"),
            Protocol::Stop => f.write_str("stop"),
            Protocol::Check => f.write_str("check"),
            Protocol::Terminate { follow_up: None } => f.write_str("terminate"),
            Protocol::Terminate {
                follow_up: Some(path),
            } => write!(f, "terminate -> {}", path),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmTransition {
    Triggered,
    Cleared,
    Unchanged,
}

#[derive(Debug)]
pub struct Alarm {
    name: String,
    condition: Formula,
    definitions: BTreeMap<String, String>,
    protocol: Protocol,
    active: bool,
    triggered: u64,
}

impl Alarm {
    pub fn new<I, S, T>(
        name: impl Into<String>,
        condition: &str,
        definitions: I,
        protocol: Protocol,
    ) -> AppResult<Self>
    where
        I: IntoIterator<Item = (S, T)>,
        S: Into<String>,
        T: Into<String>,
    {
        let name = name.into();
        let condition = Formula::compile(condition)?;
        let definitions: BTreeMap<String, String> = definitions
            .into_iter()
            .map(|(s, v)| (s.into(), v.into()))
            .collect();
        if let Some(missing) = condition.symbols().find(|s| !definitions.contains_key(*s)) {
            return Err(DaqError::Configuration(format!(
                "alarm '{}': symbol '{}' has no definition",
                name, missing
            )));
        }
        Ok(Self {
            name,
            condition,
            definitions,
            protocol,
            active: false,
            triggered: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Number of false→true transitions so far.
    pub fn trigger_count(&self) -> u64 {
        self.triggered
    }

    /// Variables the condition reads.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.definitions.values().map(String::as_str)
    }

    fn condition_holds(&self, state: &State) -> AppResult<bool> {
        let condition_error = |reason: String| DaqError::AlarmCondition {
            alarm: self.name.clone(),
            reason,
        };

        let mut values: HashMap<&str, Value> = HashMap::with_capacity(self.definitions.len());
        for (symbol, variable) in &self.definitions {
            let value = state
                .value(variable)
                .ok_or_else(|| condition_error(format!("'{}' has no current value", variable)))?;
            values.insert(symbol.as_str(), value.clone());
        }
        let result = self
            .condition
            .evaluate(&values)
            .map_err(|e| condition_error(e.to_string()))?;
        result
            .as_bool()
            .ok_or_else(|| condition_error(format!("condition produced non-boolean '{}'", result)))
    }

    /// Re-evaluates against `state`.
    ///
    /// A condition that cannot be evaluated counts as not holding for this iteration:
    /// an active alarm clears, and the error is handed back alongside the transition.
    pub fn evaluate(&mut self, state: &State) -> (AlarmTransition, Option<DaqError>) {
        let (holds, error) = match self.condition_holds(state) {
            Ok(holds) => (holds, None),
            Err(err) => (false, Some(err)),
        };
        let transition = match (self.active, holds) {
            (false, true) => {
                self.triggered += 1;
                warn!(alarm = %self.name, protocol = %self.protocol, "Alarm triggered");
                AlarmTransition::Triggered
            }
            (true, false) => {
                info!(alarm = %self.name, "Alarm cleared");
                AlarmTransition::Cleared
            }
            _ => AlarmTransition::Unchanged,
        };
        self.active = holds;
        (transition, error)
    }
}
