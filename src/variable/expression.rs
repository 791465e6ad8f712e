//! Restricted formula compiler and evaluator.
//!
//! Formulas are parsed once by `evalexpr` into an operator tree, which is then checked
//! against a whitelist: arithmetic (`+ - * / %`, `^` for powers), comparisons, boolean
//! logic, literals, tuples, read-only symbols and the functions in [`FUNCTIONS`].
//! Assignments, chaining and any other function are rejected before the formula is ever
//! evaluated. Evaluation runs against a fresh context holding only the bound symbol
//! values and the whitelisted functions.

use super::Variable;
use crate::core::Value;
use crate::error::{AppResult, DaqError};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use evalexpr::{
    build_operator_tree, ContextWithMutableFunctions, ContextWithMutableVariables,
    EvalexprError, EvalexprResult, Function, HashMapContext, Node, Operator,
    Value as EvalValue,
};
use std::collections::{BTreeSet, HashMap};

/// Functions a formula may call.
pub const FUNCTIONS: &[&str] = &[
    "sqrt", "exp", "log", "abs", "sin", "cos", "tan", "sum", "mean", "rms", "std", "var",
    "diff", "max", "min",
];

/// A parsed, whitelisted formula.
#[derive(Debug, Clone)]
pub struct Formula {
    source: String,
    tree: Node,
    symbols: BTreeSet<String>,
}

impl Formula {
    pub fn compile(source: &str) -> AppResult<Self> {
        let tree = build_operator_tree(source)
            .map_err(|e| DaqError::Expression(format!("cannot parse {:?}: {}", source, e)))?;

        for node in tree.iter() {
            check_operator(node.operator())
                .map_err(|reason| DaqError::Expression(format!("{:?}: {}", source, reason)))?;
        }

        let symbols = tree
            .iter_variable_identifiers()
            .map(str::to_string)
            .collect();

        Ok(Self {
            source: source.to_string(),
            tree,
            symbols,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Symbols referenced by the formula.
    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.symbols.iter().map(String::as_str)
    }

    /// Evaluates with the given symbol values. Every referenced symbol must be bound.
    pub fn evaluate(&self, bindings: &HashMap<&str, Value>) -> AppResult<Value> {
        let mut context = HashMapContext::new();
        for symbol in &self.symbols {
            let value = bindings
                .get(symbol.as_str())
                .ok_or_else(|| DaqError::Expression(format!("undefined symbol '{}'", symbol)))?;
            context
                .set_value(symbol.clone(), to_eval(value))
                .map_err(|e| DaqError::Expression(e.to_string()))?;
        }
        register_functions(&mut context).map_err(|e| DaqError::Expression(e.to_string()))?;

        let result = self
            .tree
            .eval_with_context(&context)
            .map_err(|e| DaqError::Expression(format!("{:?}: {}", self.source, e)))?;
        let value = from_eval(result)?;
        if !value.is_finite() {
            return Err(DaqError::Expression(format!(
                "{:?} evaluated to a non-finite result",
                self.source
            )));
        }
        Ok(value)
    }
}

fn check_operator(operator: &Operator) -> Result<(), String> {
    match operator {
        Operator::RootNode
        | Operator::Add
        | Operator::Sub
        | Operator::Neg
        | Operator::Mul
        | Operator::Div
        | Operator::Mod
        | Operator::Exp
        | Operator::Eq
        | Operator::Neq
        | Operator::Gt
        | Operator::Lt
        | Operator::Geq
        | Operator::Leq
        | Operator::And
        | Operator::Or
        | Operator::Not
        | Operator::Tuple
        | Operator::Const { .. }
        | Operator::VariableIdentifierRead { .. } => Ok(()),
        Operator::FunctionIdentifier { identifier } => {
            if FUNCTIONS.contains(&identifier.as_str()) {
                Ok(())
            } else {
                Err(format!("function '{}' is not allowed", identifier))
            }
        }
        other => Err(format!("operator {:?} is not allowed", other)),
    }
}

fn to_eval(value: &Value) -> EvalValue {
    match value {
        Value::Boolean(b) => EvalValue::Boolean(*b),
        Value::Toggle(t) => EvalValue::Boolean(t.is_on()),
        Value::Integer(i) => EvalValue::Int(*i),
        Value::Float(f) => EvalValue::Float(*f),
        Value::String(s) => EvalValue::String(s.clone()),
        Value::Array(items) => EvalValue::Tuple(items.iter().map(to_eval).collect()),
    }
}

fn from_eval(value: EvalValue) -> AppResult<Value> {
    match value {
        EvalValue::Boolean(b) => Ok(Value::Boolean(b)),
        EvalValue::Int(i) => Ok(Value::Integer(i)),
        EvalValue::Float(f) => Ok(Value::Float(f)),
        EvalValue::String(s) => Ok(Value::String(s)),
        EvalValue::Tuple(items) => Ok(Value::Array(
            items.into_iter().map(from_eval).collect::<AppResult<_>>()?,
        )),
        EvalValue::Empty => Err(DaqError::Expression("formula produced no value".to_string())),
    }
}

/// Flattens numbers out of scalars and (nested) tuples.
fn numbers(argument: &EvalValue, out: &mut Vec<f64>) -> EvalexprResult<()> {
    match argument {
        EvalValue::Float(f) => out.push(*f),
        EvalValue::Int(i) => out.push(*i as f64),
        EvalValue::Boolean(b) => out.push(if *b { 1.0 } else { 0.0 }),
        EvalValue::Tuple(items) => {
            for item in items {
                numbers(item, out)?;
            }
        }
        EvalValue::Empty => {}
        EvalValue::String(s) => {
            return Err(EvalexprError::CustomMessage(format!(
                "expected a number, found string {:?}",
                s
            )))
        }
    }
    Ok(())
}

fn finite_numbers(argument: &EvalValue) -> EvalexprResult<Vec<f64>> {
    let mut out = Vec::new();
    numbers(argument, &mut out)?;
    out.retain(|x| !x.is_nan());
    Ok(out)
}

fn unary(f: fn(f64) -> f64) -> Function {
    Function::new(move |argument: &EvalValue| match argument {
        EvalValue::Tuple(items) => Ok(EvalValue::Tuple(
            items
                .iter()
                .map(|item| item.as_number().map(|x| EvalValue::Float(f(x))))
                .collect::<EvalexprResult<_>>()?,
        )),
        other => Ok(EvalValue::Float(f(other.as_number()?))),
    })
}

fn reduce(f: fn(&[f64]) -> f64) -> Function {
    Function::new(move |argument: &EvalValue| Ok(EvalValue::Float(f(&finite_numbers(argument)?))))
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        f64::NAN
    } else {
        xs.iter().sum::<f64>() / xs.len() as f64
    }
}

fn variance(xs: &[f64]) -> f64 {
    let m = mean(xs);
    mean(&xs.iter().map(|x| (x - m).powi(2)).collect::<Vec<_>>())
}

fn register_functions(context: &mut HashMapContext) -> EvalexprResult<()> {
    context.set_function("sqrt".into(), unary(f64::sqrt))?;
    context.set_function("exp".into(), unary(f64::exp))?;
    context.set_function("log".into(), unary(f64::ln))?;
    context.set_function("abs".into(), unary(f64::abs))?;
    context.set_function("sin".into(), unary(f64::sin))?;
    context.set_function("cos".into(), unary(f64::cos))?;
    context.set_function("tan".into(), unary(f64::tan))?;
    context.set_function("sum".into(), reduce(|xs| xs.iter().sum()))?;
    context.set_function("mean".into(), reduce(mean))?;
    context.set_function(
        "rms".into(),
        reduce(|xs| mean(&xs.iter().map(|x| x * x).collect::<Vec<_>>()).sqrt()),
    )?;
    context.set_function("std".into(), reduce(|xs| variance(xs).sqrt()))?;
    context.set_function("var".into(), reduce(variance))?;
    context.set_function(
        "max".into(),
        reduce(|xs| xs.iter().copied().fold(f64::NAN, f64::max)),
    )?;
    context.set_function(
        "min".into(),
        reduce(|xs| xs.iter().copied().fold(f64::NAN, f64::min)),
    )?;
    context.set_function(
        "diff".into(),
        Function::new(|argument: &EvalValue| {
            let mut xs = Vec::new();
            numbers(argument, &mut xs)?;
            Ok(EvalValue::Tuple(
                xs.windows(2).map(|w| EvalValue::Float(w[1] - w[0])).collect(),
            ))
        }),
    )?;
    Ok(())
}

/// Derived variable computed from other variables.
///
/// `definitions` maps each formula symbol to the name of the variable that supplies it.
/// Bindings to the actual variables are resolved once by
/// [`VariableSet`](super::VariableSet), which also rejects dependency cycles.
#[derive(Debug)]
pub struct Expression {
    name: String,
    formula: Formula,
    definitions: BTreeMap<String, String>,
    bindings: OnceLock<Vec<(String, Arc<Variable>)>>,
    cache: RwLock<Option<Value>>,
}

impl Expression {
    pub fn new<I, S, T>(name: impl Into<String>, formula: &str, definitions: I) -> AppResult<Self>
    where
        I: IntoIterator<Item = (S, T)>,
        S: Into<String>,
        T: Into<String>,
    {
        let name = name.into();
        let formula = Formula::compile(formula)?;
        let definitions: BTreeMap<String, String> = definitions
            .into_iter()
            .map(|(symbol, variable)| (symbol.into(), variable.into()))
            .collect();
        if let Some(missing) = formula.symbols().find(|s| !definitions.contains_key(*s)) {
            return Err(DaqError::Expression(format!(
                "expression '{}': symbol '{}' has no definition",
                name, missing
            )));
        }
        Ok(Self {
            name,
            formula,
            definitions,
            bindings: OnceLock::new(),
            cache: RwLock::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn formula(&self) -> &Formula {
        &self.formula
    }

    /// `(symbol, variable)` pairs.
    pub fn definitions(&self) -> impl Iterator<Item = (&str, &str)> {
        self.definitions
            .iter()
            .map(|(symbol, variable)| (symbol.as_str(), variable.as_str()))
    }

    /// Names of the variables this expression reads.
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.definitions.values().map(String::as_str)
    }

    pub(crate) fn bind(&self, bindings: Vec<(String, Arc<Variable>)>) -> AppResult<()> {
        self.bindings.set(bindings).map_err(|_| {
            DaqError::Configuration(format!("expression '{}' is already bound", self.name))
        })
    }

    pub fn cached(&self) -> Option<Value> {
        self.cache.read().clone()
    }

    /// Evaluates from current dependency values. Upstream expressions are re-evaluated;
    /// every other dependency contributes its cached value.
    pub fn evaluate(&self) -> AppResult<Value> {
        let bindings = self.bindings.get().ok_or_else(|| {
            DaqError::Expression(format!("expression '{}' is not bound", self.name))
        })?;

        let mut values = HashMap::with_capacity(bindings.len());
        for (symbol, variable) in bindings {
            let value = match variable.as_ref() {
                Variable::Expression(upstream) => upstream.evaluate()?,
                other => other.cached().ok_or_else(|| {
                    DaqError::Expression(format!(
                        "expression '{}': '{}' has no value yet",
                        self.name,
                        other.name()
                    ))
                })?,
            };
            values.insert(symbol.as_str(), value);
        }

        let result = self.formula.evaluate(&values)?;
        *self.cache.write() = Some(result.clone());
        Ok(result)
    }
}

/// Convenience for evaluating a formula with owned bindings, mostly in tests.
pub fn evaluate_str(source: &str, bindings: &[(&str, Value)]) -> AppResult<Value> {
    let formula = Formula::compile(source)?;
    let map = bindings.iter().cloned().collect::<HashMap<_, _>>();
    formula.evaluate(&map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_with_power_operator() {
        let value = evaluate_str("2 * x ^ 2 + 1", &[("x", Value::Float(3.0))]).unwrap();
        assert_eq!(value, Value::Float(19.0));
    }

    #[test]
    fn comparisons_yield_booleans() {
        let value = evaluate_str("r > 1", &[("r", Value::Float(1.1))]).unwrap();
        assert_eq!(value, Value::Boolean(true));
        let value = evaluate_str("r > 1", &[("r", Value::Float(0.9))]).unwrap();
        assert_eq!(value, Value::Boolean(false));
    }

    #[test]
    fn whitelisted_functions_over_arrays() {
        let samples = Value::from(vec![1.0, 2.0, f64::NAN, 3.0]);
        assert_eq!(
            evaluate_str("mean(xs)", &[("xs", samples.clone())]).unwrap(),
            Value::Float(2.0)
        );
        assert_eq!(
            evaluate_str("max(xs)", &[("xs", samples.clone())]).unwrap(),
            Value::Float(3.0)
        );
        assert_eq!(
            evaluate_str("sqrt(a) + abs(b)", &[("a", Value::Float(16.0)), ("b", Value::Integer(-2))])
                .unwrap(),
            Value::Float(6.0)
        );
        assert_eq!(
            evaluate_str("min(a, b)", &[("a", Value::Float(4.0)), ("b", Value::Float(-1.0))]).unwrap(),
            Value::Float(-1.0)
        );
    }

    #[test]
    fn rejects_unknown_functions_and_assignment() {
        assert!(matches!(
            Formula::compile("math::sqrt(x)"),
            Err(DaqError::Expression(_))
        ));
        assert!(matches!(Formula::compile("x = 3"), Err(DaqError::Expression(_))));
        assert!(matches!(Formula::compile("a; b"), Err(DaqError::Expression(_))));
    }

    #[test]
    fn expression_requires_every_symbol_defined() {
        let result = Expression::new("power", "v * i", [("v", "voltage")]);
        assert!(matches!(result, Err(DaqError::Expression(_))));
        let expression = Expression::new("power", "v * i", [("v", "voltage"), ("i", "current")])
            .unwrap();
        let mut deps = expression.dependencies().collect::<Vec<_>>();
        deps.sort_unstable();
        assert_eq!(deps, vec!["current", "voltage"]);
        assert!(expression.evaluate().is_err());
    }

    #[test]
    fn reports_symbols() {
        let formula = Formula::compile("a * b + sin(a)").unwrap();
        assert_eq!(formula.symbols().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn undefined_symbol_and_non_finite_result_fail() {
        assert!(matches!(
            evaluate_str("a + b", &[("a", Value::Float(1.0))]),
            Err(DaqError::Expression(_))
        ));
        assert!(matches!(
            evaluate_str("a / b", &[("a", Value::Float(1.0)), ("b", Value::Float(0.0))]),
            Err(DaqError::Expression(_))
        ));
    }
}
