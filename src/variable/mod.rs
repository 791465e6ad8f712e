//! Experiment variables
//!
//! A [`Variable`] is a named, typed value holder. The closed set of variants shares one
//! get/set contract:
//!
//! | Variant | `get()` | `set(v)` |
//! |---|---|---|
//! | [`Knob`] | cached setpoint, no I/O | clamp, transform, commit, then cache |
//! | [`Meter`] | measure, recast, transform, cache | not settable |
//! | [`Expression`] | evaluate from dependency caches | not settable |
//! | [`Parameter`] | stored value | store |
//! | [`Remote`] | round-trip to another engine | only if the remote is settable |
//!
//! Knobs, meters and remotes reach hardware exclusively through a
//! [`ChannelHandle`](crate::adapters::ChannelHandle), so variables never lock each other.

pub mod expression;
pub mod remote;
pub mod set;

pub use expression::{Expression, Formula};
pub use remote::Remote;
pub use set::VariableSet;

use crate::core::{Value, ValueKind};
use crate::error::{AppResult, DaqError};
use crate::instrument::Instrument;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, trace};

// =============================================================================
// Transforms
// =============================================================================

/// Linear map between instrument units and experiment units:
/// `physical = multiplier * raw + offset`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine {
    pub multiplier: f64,
    pub offset: f64,
}

impl Default for Affine {
    fn default() -> Self {
        Self {
            multiplier: 1.0,
            offset: 0.0,
        }
    }
}

impl Affine {
    pub fn new(multiplier: f64, offset: f64) -> AppResult<Self> {
        if multiplier == 0.0 || !multiplier.is_finite() || !offset.is_finite() {
            return Err(DaqError::Configuration(format!(
                "invalid transform multiplier={} offset={}",
                multiplier, offset
            )));
        }
        Ok(Self { multiplier, offset })
    }

    pub fn is_identity(&self) -> bool {
        self.multiplier == 1.0 && self.offset == 0.0
    }

    fn map(&self, value: Value, f: &dyn Fn(f64) -> f64) -> AppResult<Value> {
        if self.is_identity() {
            return Ok(value);
        }
        match value {
            Value::Array(items) => Ok(Value::Array(
                items
                    .into_iter()
                    .map(|item| self.map(item, f))
                    .collect::<AppResult<_>>()?,
            )),
            Value::Integer(_) | Value::Float(_) => {
                let x = value.as_f64().unwrap_or(f64::NAN);
                Ok(Value::Float(f(x)))
            }
            other => Err(DaqError::Type(format!(
                "cannot scale {} value '{}'",
                other.kind(),
                other
            ))),
        }
    }

    /// Instrument units to experiment units.
    pub fn to_physical(&self, raw: Value) -> AppResult<Value> {
        self.map(raw, &|x| self.multiplier * x + self.offset)
    }

    /// Experiment units to instrument units.
    pub fn to_raw(&self, physical: Value) -> AppResult<Value> {
        self.map(physical, &|x| (x - self.offset) / self.multiplier)
    }
}

/// Optional clamp range for knob setpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Limits {
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

impl Limits {
    pub fn new(lower: Option<f64>, upper: Option<f64>) -> AppResult<Self> {
        if let (Some(lo), Some(hi)) = (lower, upper) {
            if lo > hi {
                return Err(DaqError::Configuration(format!(
                    "lower limit {} exceeds upper limit {}",
                    lo, hi
                )));
            }
        }
        Ok(Self { lower, upper })
    }

    /// Clamps numeric scalars; everything else passes through.
    pub fn clamp(&self, value: Value) -> Value {
        match value {
            Value::Float(x) => {
                let mut x = x;
                if let Some(lo) = self.lower {
                    x = x.max(lo);
                }
                if let Some(hi) = self.upper {
                    x = x.min(hi);
                }
                Value::Float(x)
            }
            Value::Integer(i) => {
                let mut i = i;
                if let Some(lo) = self.lower {
                    i = i.max(lo.ceil() as i64);
                }
                if let Some(hi) = self.upper {
                    i = i.min(hi.floor() as i64);
                }
                Value::Integer(i)
            }
            other => other,
        }
    }
}

fn coerce(value: Value, kind: Option<ValueKind>) -> AppResult<Value> {
    match kind {
        Some(kind) => value.recast_to(kind),
        None => Ok(value),
    }
}

/// Instrument value to a cached experiment value: scaled first, then recast to the
/// declared kind.
fn to_physical(raw: Value, transform: &Affine, kind: Option<ValueKind>) -> AppResult<Value> {
    let raw = match raw {
        Value::String(text) if !transform.is_identity() => Value::recast(&text)?,
        other => other,
    };
    coerce(transform.to_physical(raw)?, kind)
}

// =============================================================================
// Knob
// =============================================================================

/// Settable variable backed by an instrument knob.
#[derive(Debug)]
pub struct Knob {
    name: String,
    instrument: Arc<Instrument>,
    knob: String,
    kind: Option<ValueKind>,
    limits: Limits,
    transform: Affine,
    critical: bool,
    cache: RwLock<Option<Value>>,
}

impl Knob {
    pub fn new(name: impl Into<String>, instrument: Arc<Instrument>, knob: &str) -> AppResult<Self> {
        let name = name.into();
        if !instrument.has_knob(knob) {
            return Err(DaqError::Configuration(format!(
                "knob '{}': instrument '{}' has no knob '{}'",
                name,
                instrument.name(),
                knob
            )));
        }
        Ok(Self {
            name,
            instrument,
            knob: knob.to_string(),
            kind: None,
            limits: Limits::default(),
            transform: Affine::default(),
            critical: false,
            cache: RwLock::new(None),
        })
    }

    pub fn with_kind(mut self, kind: ValueKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_transform(mut self, transform: Affine) -> Self {
        self.transform = transform;
        self
    }

    /// Marks commits to this knob as safety-critical: exhausting the channel ends the run.
    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn is_critical(&self) -> bool {
        self.critical
    }

    pub fn instrument(&self) -> &Arc<Instrument> {
        &self.instrument
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn cached(&self) -> Option<Value> {
        self.cache.read().clone()
    }

    pub async fn set(&self, value: Value) -> AppResult<Value> {
        let value = self.limits.clamp(coerce(value, self.kind)?);
        let raw = self.transform.to_raw(value.clone())?;
        self.instrument.set_knob(&self.knob, &raw).await?;
        debug!(variable = %self.name, value = %value, "Knob committed");
        *self.cache.write() = Some(value.clone());
        Ok(value)
    }

    /// Seeds the cache from the instrument preset or its read-back query.
    async fn initialize(&self) -> AppResult<()> {
        let raw = match self.instrument.preset_for(&self.knob) {
            Some(preset) => Some(preset),
            None => self.instrument.read_knob(&self.knob).await?,
        };
        if let Some(raw) = raw {
            let value = to_physical(raw, &self.transform, self.kind)?;
            debug!(variable = %self.name, value = %value, "Knob cache seeded");
            *self.cache.write() = Some(value);
        }
        Ok(())
    }
}

// =============================================================================
// Meter
// =============================================================================

/// Read-only measured variable.
#[derive(Debug)]
pub struct Meter {
    name: String,
    instrument: Arc<Instrument>,
    meter: String,
    kind: Option<ValueKind>,
    transform: Affine,
    cache: RwLock<Option<Value>>,
}

impl Meter {
    pub fn new(name: impl Into<String>, instrument: Arc<Instrument>, meter: &str) -> AppResult<Self> {
        let name = name.into();
        if !instrument.has_meter(meter) {
            return Err(DaqError::Configuration(format!(
                "meter '{}': instrument '{}' has no meter '{}'",
                name,
                instrument.name(),
                meter
            )));
        }
        Ok(Self {
            name,
            instrument,
            meter: meter.to_string(),
            kind: None,
            transform: Affine::default(),
            cache: RwLock::new(None),
        })
    }

    pub fn with_kind(mut self, kind: ValueKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_transform(mut self, transform: Affine) -> Self {
        self.transform = transform;
        self
    }

    pub fn instrument(&self) -> &Arc<Instrument> {
        &self.instrument
    }

    pub fn cached(&self) -> Option<Value> {
        self.cache.read().clone()
    }

    pub async fn measure(&self) -> AppResult<Value> {
        let raw = self.instrument.measure(&self.meter).await?;
        let value = to_physical(raw, &self.transform, self.kind)?;
        trace!(variable = %self.name, value = %value, "Measured");
        *self.cache.write() = Some(value.clone());
        Ok(value)
    }
}

// =============================================================================
// Parameter
// =============================================================================

/// Instrument-independent value held in memory.
#[derive(Debug)]
pub struct Parameter {
    name: String,
    kind: Option<ValueKind>,
    value: RwLock<Value>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, initial: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            kind: None,
            value: RwLock::new(initial.into()),
        }
    }

    /// Fixes the kind; the current value is recast immediately.
    pub fn with_kind(self, kind: ValueKind) -> AppResult<Self> {
        let current = self.value.into_inner().recast_to(kind)?;
        Ok(Self {
            name: self.name,
            kind: Some(kind),
            value: RwLock::new(current),
        })
    }

    pub fn get(&self) -> Value {
        self.value.read().clone()
    }

    pub fn set(&self, value: Value) -> AppResult<Value> {
        let value = coerce(value, self.kind)?;
        *self.value.write() = value.clone();
        Ok(value)
    }
}

// =============================================================================
// Variable
// =============================================================================

/// Tagged variant over every variable kind.
#[derive(Debug)]
pub enum Variable {
    Knob(Knob),
    Meter(Meter),
    Expression(Expression),
    Parameter(Parameter),
    Remote(Remote),
}

impl From<Knob> for Variable {
    fn from(v: Knob) -> Self {
        Variable::Knob(v)
    }
}

impl From<Meter> for Variable {
    fn from(v: Meter) -> Self {
        Variable::Meter(v)
    }
}

impl From<Expression> for Variable {
    fn from(v: Expression) -> Self {
        Variable::Expression(v)
    }
}

impl From<Parameter> for Variable {
    fn from(v: Parameter) -> Self {
        Variable::Parameter(v)
    }
}

impl From<Remote> for Variable {
    fn from(v: Remote) -> Self {
        Variable::Remote(v)
    }
}

impl Variable {
    pub fn name(&self) -> &str {
        match self {
            Variable::Knob(v) => &v.name,
            Variable::Meter(v) => &v.name,
            Variable::Expression(v) => v.name(),
            Variable::Parameter(v) => &v.name,
            Variable::Remote(v) => v.name(),
        }
    }

    pub fn variant(&self) -> &'static str {
        match self {
            Variable::Knob(_) => "knob",
            Variable::Meter(_) => "meter",
            Variable::Expression(_) => "expression",
            Variable::Parameter(_) => "parameter",
            Variable::Remote(_) => "remote",
        }
    }

    pub fn is_settable(&self) -> bool {
        match self {
            Variable::Knob(_) | Variable::Parameter(_) => true,
            Variable::Remote(remote) => remote.is_settable(),
            Variable::Meter(_) | Variable::Expression(_) => false,
        }
    }

    pub fn is_expression(&self) -> bool {
        matches!(self, Variable::Expression(_))
    }

    /// Whether `get()` reaches an instrument or another engine.
    pub fn performs_io(&self) -> bool {
        matches!(self, Variable::Meter(_) | Variable::Remote(_))
    }

    /// Last known value without any I/O or evaluation.
    pub fn cached(&self) -> Option<Value> {
        match self {
            Variable::Knob(v) => v.cached(),
            Variable::Meter(v) => v.cached(),
            Variable::Expression(v) => v.cached(),
            Variable::Parameter(v) => Some(v.get()),
            Variable::Remote(v) => v.cached(),
        }
    }

    pub async fn get(&self) -> AppResult<Value> {
        match self {
            Variable::Knob(v) => v.cached().ok_or_else(|| DaqError::NoValue(v.name.clone())),
            Variable::Meter(v) => v.measure().await,
            Variable::Expression(v) => v.evaluate(),
            Variable::Parameter(v) => Ok(v.get()),
            Variable::Remote(v) => v.get().await,
        }
    }

    /// Commits `value`; returns the value actually held afterwards (after clamping
    /// or coercion).
    pub async fn set(&self, value: Value) -> AppResult<Value> {
        match self {
            Variable::Knob(v) => v.set(value).await,
            Variable::Parameter(v) => v.set(value),
            Variable::Remote(v) => v.set(value).await,
            Variable::Meter(_) | Variable::Expression(_) => {
                Err(DaqError::NotSettable(self.name().to_string()))
            }
        }
    }

    /// Exhausting the channel while committing to this variable ends the run.
    pub fn is_critical(&self) -> bool {
        matches!(self, Variable::Knob(knob) if knob.is_critical())
    }

    pub(crate) async fn initialize(&self) -> AppResult<()> {
        match self {
            Variable::Knob(v) => v.initialize().await,
            Variable::Remote(v) => v.connect().await,
            Variable::Meter(_) | Variable::Expression(_) | Variable::Parameter(_) => Ok(()),
        }
    }

    pub fn instrument(&self) -> Option<&Arc<Instrument>> {
        match self {
            Variable::Knob(v) => Some(v.instrument()),
            Variable::Meter(v) => Some(v.instrument()),
            _ => None,
        }
    }
}
