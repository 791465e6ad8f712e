//! Knob ownership and the external get/set entry point.

use super::Diagnostic;
use crate::core::Value;
use crate::error::{AppResult, DaqError};
use crate::routine::Assignment;
use crate::variable::VariableSet;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Which routine currently controls which knob.
///
/// The first active routine to assign a knob claims it; the claim lasts until that
/// routine goes inert.
#[derive(Debug, Default)]
pub struct Claims {
    owners: RwLock<HashMap<String, String>>,
}

impl Claims {
    pub fn owner(&self, knob: &str) -> Option<String> {
        self.owners.read().get(knob).cloned()
    }

    /// Keeps the assignments `routine` may make, claiming unclaimed knobs. Dropped
    /// assignments are reported as diagnostics.
    pub fn admit(
        &self,
        routine: &str,
        assignments: Vec<Assignment>,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Vec<Assignment> {
        let mut owners = self.owners.write();
        assignments
            .into_iter()
            .filter(|(knob, _)| {
                let owner = owners
                    .entry(knob.clone())
                    .or_insert_with(|| routine.to_string())
                    .clone();
                if owner == routine {
                    true
                } else {
                    warn!(routine, knob = %knob, owner = %owner, "Knob controlled by another routine");
                    diagnostics.push(Diagnostic::new(
                        routine,
                        format!("'{}' is controlled by routine '{}'", knob, owner),
                    ));
                    false
                }
            })
            .collect()
    }

    pub fn release(&self, routine: &str) {
        let mut owners = self.owners.write();
        let before = owners.len();
        owners.retain(|_, owner| owner != routine);
        if owners.len() != before {
            debug!(routine, "Released knob claims");
        }
    }
}

/// Thread-safe `get`/`set` over the variables exposed to other processes.
///
/// `get` returns the latest cached value and never triggers instrument I/O. `set` is
/// refused for knobs currently controlled by a routine.
#[derive(Debug, Clone)]
pub struct RemoteAccess {
    variables: Arc<VariableSet>,
    claims: Arc<Claims>,
    exposed: Option<Arc<HashSet<String>>>,
}

impl RemoteAccess {
    pub(crate) fn new(variables: Arc<VariableSet>, claims: Arc<Claims>) -> Self {
        Self {
            variables,
            claims,
            exposed: None,
        }
    }

    /// Restricts access to the named subset.
    pub fn exposing<I, S>(mut self, names: I) -> AppResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: HashSet<String> = names.into_iter().map(Into::into).collect();
        if let Some(unknown) = names.iter().find(|n| self.variables.get(n).is_none()) {
            return Err(DaqError::Configuration(format!(
                "cannot expose unknown variable '{}'",
                unknown
            )));
        }
        self.exposed = Some(Arc::new(names));
        Ok(self)
    }

    fn lookup(&self, name: &str) -> AppResult<&Arc<crate::variable::Variable>> {
        let visible = self.exposed.as_ref().map_or(true, |e| e.contains(name));
        self.variables
            .get(name)
            .filter(|_| visible)
            .ok_or_else(|| DaqError::Configuration(format!("no exposed variable '{}'", name)))
    }

    pub fn names(&self) -> Vec<String> {
        self.variables
            .names()
            .filter(|n| self.exposed.as_ref().map_or(true, |e| e.contains(*n)))
            .map(str::to_string)
            .collect()
    }

    pub fn get(&self, name: &str) -> AppResult<Value> {
        let variable = self.lookup(name)?;
        variable
            .cached()
            .ok_or_else(|| DaqError::NoValue(name.to_string()))
    }

    /// Whether `set` would currently be accepted.
    pub fn is_settable(&self, name: &str) -> AppResult<bool> {
        let variable = self.lookup(name)?;
        Ok(variable.is_settable() && self.claims.owner(name).is_none())
    }

    pub async fn set(&self, name: &str, value: Value) -> AppResult<Value> {
        let variable = self.lookup(name)?;
        if let Some(routine) = self.claims.owner(name) {
            return Err(DaqError::Controlled {
                variable: name.to_string(),
                routine,
            });
        }
        variable.set(value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variable::{Parameter, Variable};

    fn access() -> (RemoteAccess, Arc<Claims>) {
        let variables = VariableSet::new(vec![
            Variable::from(Parameter::new("gain", 1.0)),
            Variable::from(Parameter::new("offset", 0.0)),
        ])
        .unwrap();
        let claims = Arc::new(Claims::default());
        (RemoteAccess::new(Arc::new(variables), claims.clone()), claims)
    }

    #[test]
    fn claims_first_routine_wins() {
        let claims = Claims::default();
        let mut diagnostics = Vec::new();
        let a = claims.admit("a", vec![("k".into(), Value::Float(1.0))], &mut diagnostics);
        let b = claims.admit("b", vec![("k".into(), Value::Float(2.0))], &mut diagnostics);
        assert_eq!(a.len(), 1);
        assert!(b.is_empty());
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].source, "b");

        claims.release("a");
        let b = claims.admit("b", vec![("k".into(), Value::Float(2.0))], &mut diagnostics);
        assert_eq!(b.len(), 1);
        assert_eq!(claims.owner("k").as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn set_refused_while_claimed() {
        let (access, claims) = access();
        access.set("gain", Value::Float(2.0)).await.unwrap();
        assert_eq!(access.get("gain").unwrap(), Value::Float(2.0));

        claims.admit("ramp", vec![("gain".into(), Value::Float(3.0))], &mut Vec::new());
        assert!(!access.is_settable("gain").unwrap());
        assert!(matches!(
            access.set("gain", Value::Float(5.0)).await,
            Err(DaqError::Controlled { .. })
        ));
    }

    #[tokio::test]
    async fn exposure_limits_visibility() {
        let (access, _) = access();
        let access = access.exposing(["gain"]).unwrap();
        assert_eq!(access.names(), vec!["gain".to_string()]);
        assert!(access.get("offset").is_err());
        assert!(access.clone().exposing(["missing"]).is_err());
    }
}
