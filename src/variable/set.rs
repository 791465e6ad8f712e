use super::Variable;
use crate::error::{AppResult, DaqError};
use crate::instrument::Instrument;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{info, warn};

/// The experiment's ordered, name-unique variable collection.
///
/// Construction validates the whole set: duplicate names, expressions that refer to
/// unknown variables and dependency cycles between expressions are rejected here, so
/// evaluation never has to detect them.
#[derive(Debug, Clone)]
pub struct VariableSet {
    variables: Vec<Arc<Variable>>,
    index: HashMap<String, usize>,
    expression_order: Vec<usize>,
}

impl VariableSet {
    pub fn new(variables: Vec<Variable>) -> AppResult<Self> {
        let variables: Vec<Arc<Variable>> = variables.into_iter().map(Arc::new).collect();

        let mut index = HashMap::with_capacity(variables.len());
        for (i, variable) in variables.iter().enumerate() {
            if index.insert(variable.name().to_string(), i).is_some() {
                return Err(DaqError::Configuration(format!(
                    "duplicate variable name '{}'",
                    variable.name()
                )));
            }
        }

        for variable in &variables {
            if let Variable::Expression(expression) = variable.as_ref() {
                for dependency in expression.dependencies() {
                    if !index.contains_key(dependency) {
                        return Err(DaqError::Configuration(format!(
                            "expression '{}' refers to unknown variable '{}'",
                            expression.name(),
                            dependency
                        )));
                    }
                }
            }
        }

        let expression_order = expression_order(&variables, &index)?;

        for variable in &variables {
            if let Variable::Expression(expression) = variable.as_ref() {
                let bindings = expression
                    .formula()
                    .symbols()
                    .filter_map(|symbol| {
                        let target = expression_target(expression, symbol)?;
                        let i = index.get(target)?;
                        Some((symbol.to_string(), variables[*i].clone()))
                    })
                    .collect();
                expression.bind(bindings)?;
            }
        }

        Ok(Self {
            variables,
            index,
            expression_order,
        })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<Variable>> {
        self.index.get(name).map(|i| &self.variables[*i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Variable>> {
        self.variables.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.variables.iter().map(|v| v.name())
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Expressions ordered so every expression follows the expressions it depends on.
    pub fn expressions_in_order(&self) -> impl Iterator<Item = &Arc<Variable>> {
        self.expression_order.iter().map(|i| &self.variables[*i])
    }

    /// `names` plus everything they read through expressions, transitively.
    pub fn closure<'a>(&'a self, names: impl IntoIterator<Item = &'a str>) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut pending: Vec<&str> = names.into_iter().collect();
        while let Some(name) = pending.pop() {
            if !seen.insert(name.to_string()) {
                continue;
            }
            if let Some(Variable::Expression(expression)) = self.get(name).map(|v| v.as_ref()) {
                pending.extend(expression.dependencies());
            }
        }
        seen
    }

    /// Instruments behind knobs and meters, each listed once.
    pub fn instruments(&self) -> Vec<Arc<Instrument>> {
        let mut seen = HashSet::new();
        self.variables
            .iter()
            .filter_map(|v| v.instrument())
            .filter(|instrument| seen.insert(instrument.name().to_string()))
            .cloned()
            .collect()
    }

    /// Connects every instrument once (applying presets), seeds knob caches and checks
    /// remotes.
    pub async fn initialize(&self) -> AppResult<()> {
        for instrument in self.instruments() {
            instrument.connect().await?;
        }
        for variable in &self.variables {
            variable.initialize().await?;
        }
        info!(variables = self.variables.len(), "Variables initialized");
        Ok(())
    }

    /// Applies postsets and closes every instrument and remote channel. All channels are
    /// attempted; failures are collected.
    pub async fn shutdown(&self) -> AppResult<()> {
        let mut errors = Vec::new();
        for instrument in self.instruments() {
            if let Err(err) = instrument.disconnect().await {
                warn!(instrument = %instrument.name(), error = %err, "Instrument teardown failed");
                errors.push(err);
            }
        }
        for variable in &self.variables {
            if let Variable::Remote(remote) = variable.as_ref() {
                if let Err(err) = remote.channel().shutdown().await {
                    errors.push(err);
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(errors))
        }
    }
}

fn expression_target<'a>(expression: &'a super::Expression, symbol: &str) -> Option<&'a str> {
    expression
        .definitions()
        .find(|(s, _)| *s == symbol)
        .map(|(_, target)| target)
}

/// Kahn's algorithm over expression-to-expression edges.
fn expression_order(
    variables: &[Arc<Variable>],
    index: &HashMap<String, usize>,
) -> AppResult<Vec<usize>> {
    let mut indegree: HashMap<usize, usize> = HashMap::new();
    let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();

    for (i, variable) in variables.iter().enumerate() {
        let Variable::Expression(expression) = variable.as_ref() else {
            continue;
        };
        indegree.entry(i).or_insert(0);
        let upstream: HashSet<usize> = expression
            .dependencies()
            .filter_map(|name| index.get(name).copied())
            .filter(|j| variables[*j].is_expression())
            .collect();
        for j in upstream {
            *indegree.entry(i).or_insert(0) += 1;
            dependents.entry(j).or_default().push(i);
        }
    }

    let mut ready: VecDeque<usize> = {
        let mut roots: Vec<usize> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| *i)
            .collect();
        roots.sort_unstable();
        roots.into()
    };
    let mut order = Vec::with_capacity(indegree.len());
    while let Some(i) = ready.pop_front() {
        order.push(i);
        for &k in dependents.get(&i).map(Vec::as_slice).unwrap_or_default() {
            if let Some(d) = indegree.get_mut(&k) {
                *d -= 1;
                if *d == 0 {
                    ready.push_back(k);
                }
            }
        }
    }

    if order.len() < indegree.len() {
        let mut cyclic: Vec<&str> = indegree
            .iter()
            .filter(|(i, _)| !order.contains(i))
            .map(|(i, _)| variables[*i].name())
            .collect();
        cyclic.sort_unstable();
        return Err(DaqError::Expression(format!(
            "dependency cycle among {}",
            cyclic.join(", ")
        )));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;
    use crate::variable::{Expression, Parameter};

    fn parameter(name: &str, value: f64) -> Variable {
        Parameter::new(name, value).into()
    }

    fn expression(name: &str, formula: &str, defs: &[(&str, &str)]) -> Variable {
        Expression::new(name, formula, defs.iter().copied())
            .unwrap()
            .into()
    }

    #[test]
    fn rejects_duplicate_names() {
        let result = VariableSet::new(vec![parameter("a", 1.0), parameter("a", 2.0)]);
        assert!(matches!(result, Err(DaqError::Configuration(_))));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let result = VariableSet::new(vec![expression("r", "2 * x", &[("x", "missing")])]);
        assert!(matches!(result, Err(DaqError::Configuration(_))));
    }

    #[test]
    fn rejects_cycles_at_build_time() {
        let result = VariableSet::new(vec![
            expression("a", "b + 1", &[("b", "b")]),
            expression("b", "a + 1", &[("a", "a")]),
            parameter("c", 0.0),
        ]);
        match result {
            Err(DaqError::Expression(message)) => assert!(message.contains("a, b")),
            other => panic!("expected cycle error, got {:?}", other),
        }

        let result = VariableSet::new(vec![expression("s", "s * 2", &[("s", "s")])]);
        assert!(matches!(result, Err(DaqError::Expression(_))));
    }

    #[test]
    fn closure_follows_expression_dependencies() {
        let set = VariableSet::new(vec![
            expression("double_sum", "2 * s", &[("s", "sum")]),
            expression("sum", "x + y", &[("x", "a"), ("y", "b")]),
            parameter("a", 1.0),
            parameter("b", 2.5),
            parameter("unrelated", 0.0),
        ])
        .unwrap();
        let mut names: Vec<String> = set.closure(["double_sum"]).into_iter().collect();
        names.sort();
        assert_eq!(names, vec!["a", "b", "double_sum", "sum"]);
        assert_eq!(set.closure(["a"]).len(), 1);
    }

    #[tokio::test]
    async fn chained_expressions_evaluate_from_caches() {
        let set = VariableSet::new(vec![
            expression("double_sum", "2 * s", &[("s", "sum")]),
            expression("sum", "x + y", &[("x", "a"), ("y", "b")]),
            parameter("a", 1.0),
            parameter("b", 2.5),
        ])
        .unwrap();

        let order: Vec<&str> = set.expressions_in_order().map(|v| v.name()).collect();
        assert_eq!(order, vec!["sum", "double_sum"]);

        let top = set.get("double_sum").unwrap();
        let first = top.get().await.unwrap();
        let second = top.get().await.unwrap();
        assert_eq!(first, Value::Float(7.0));
        assert_eq!(first, second);

        set.get("a").unwrap().set(Value::Float(2.0)).await.unwrap();
        assert_eq!(top.get().await.unwrap(), Value::Float(9.0));
    }
}
