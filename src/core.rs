//! Canonical value types shared by variables, routines and the published state.
//!
//! Every value entering or leaving a [`Variable`](crate::variable::Variable) is recast
//! into the closed set of kinds represented by [`Value`]. Raw instrument responses arrive
//! as text and are inferred by [`Value::recast`]; values arriving from configuration or
//! remote servers as JSON go through [`Value::from_json`]. A variable that declares a
//! [`ValueKind`] additionally coerces with [`Value::recast_to`].

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

// =============================================================================
// Toggle
// =============================================================================

/// Two-state switch value reported by instruments as `ON`/`OFF`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Toggle {
    On,
    Off,
}

impl Toggle {
    /// Parses the accepted toggle spellings.
    pub fn parse(text: &str) -> Option<Toggle> {
        match text {
            "ON" | "On" | "on" => Some(Toggle::On),
            "OFF" | "Off" | "off" => Some(Toggle::Off),
            _ => None,
        }
    }

    pub fn is_on(self) -> bool {
        self == Toggle::On
    }
}

impl From<bool> for Toggle {
    fn from(value: bool) -> Self {
        if value {
            Toggle::On
        } else {
            Toggle::Off
        }
    }
}

impl fmt::Display for Toggle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Toggle::On => write!(f, "ON"),
            Toggle::Off => write!(f, "OFF"),
        }
    }
}

// =============================================================================
// Value
// =============================================================================

/// The kinds a [`Value`] can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Boolean,
    Toggle,
    Integer,
    Float,
    String,
    Array,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Boolean => "boolean",
            ValueKind::Toggle => "toggle",
            ValueKind::Integer => "integer",
            ValueKind::Float => "float",
            ValueKind::String => "string",
            ValueKind::Array => "array",
        };
        write!(f, "{}", name)
    }
}

/// A canonical experiment value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Boolean(bool),
    Toggle(Toggle),
    Integer(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Toggle(t) => write!(f, "{}", t),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(fl) => write!(f, "{}", fl),
            Value::String(s) => write!(f, "{}", s),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Boolean(_) => ValueKind::Boolean,
            Value::Toggle(_) => ValueKind::Toggle,
            Value::Integer(_) => ValueKind::Integer,
            Value::Float(_) => ValueKind::Float,
            Value::String(_) => ValueKind::String,
            Value::Array(_) => ValueKind::Array,
        }
    }

    /// Numeric view of scalar values. Booleans and toggles map to 1.0/0.0.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Toggle(t) => Some(if t.is_on() { 1.0 } else { 0.0 }),
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::String(_) | Value::Array(_) => None,
        }
    }

    /// Truth value of scalar values; numbers are true when non-zero.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            Value::Toggle(t) => Some(t.is_on()),
            Value::Integer(i) => Some(*i != 0),
            Value::Float(f) if !f.is_nan() => Some(*f != 0.0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// False only for non-finite floats (recursively for arrays).
    pub fn is_finite(&self) -> bool {
        match self {
            Value::Float(f) => f.is_finite(),
            Value::Array(items) => items.iter().all(Value::is_finite),
            _ => true,
        }
    }

    /// Infers a value from raw instrument or wire text.
    pub fn recast(raw: &str) -> AppResult<Value> {
        let text = raw.trim();
        if text.is_empty() {
            return Err(DaqError::Type("cannot recast an empty response".to_string()));
        }

        match text {
            "true" | "True" | "TRUE" => return Ok(Value::Boolean(true)),
            "false" | "False" | "FALSE" => return Ok(Value::Boolean(false)),
            _ => {}
        }

        if let Some(toggle) = Toggle::parse(text) {
            return Ok(Value::Toggle(toggle));
        }

        if looks_like_integer(text) {
            if let Ok(i) = text.parse::<i64>() {
                return Ok(Value::Integer(i));
            }
        }

        if let Ok(f) = text.parse::<f64>() {
            return Ok(Value::Float(f));
        }

        if let Some(inner) = text.strip_prefix('[').and_then(|t| t.strip_suffix(']')) {
            let inner = inner.trim();
            if inner.is_empty() {
                return Ok(Value::Array(Vec::new()));
            }
            let items = inner
                .split(',')
                .map(Value::recast)
                .collect::<AppResult<Vec<_>>>()?;
            return Ok(Value::Array(items));
        }

        Ok(Value::String(text.to_string()))
    }

    /// Converts a JSON value. Null and objects have no canonical kind.
    pub fn from_json(json: &serde_json::Value) -> AppResult<Value> {
        match json {
            serde_json::Value::Bool(b) => Ok(Value::Boolean(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Integer(i))
                } else {
                    n.as_f64()
                        .map(Value::Float)
                        .ok_or_else(|| DaqError::Type(format!("unrepresentable number {}", n)))
                }
            }
            serde_json::Value::String(s) if s.trim().is_empty() => Ok(Value::String(s.clone())),
            serde_json::Value::String(s) => Value::recast(s),
            serde_json::Value::Array(items) => Ok(Value::Array(
                items.iter().map(Value::from_json).collect::<AppResult<_>>()?,
            )),
            serde_json::Value::Null => Err(DaqError::Type("null has no value kind".to_string())),
            serde_json::Value::Object(_) => {
                Err(DaqError::Type("objects have no value kind".to_string()))
            }
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Toggle(t) => serde_json::Value::String(t.to_string()),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or_else(|| serde_json::Value::String(f.to_string())),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
        }
    }

    /// Coerces into a declared kind.
    pub fn recast_to(self, kind: ValueKind) -> AppResult<Value> {
        if self.kind() == kind {
            return Ok(self);
        }
        let mismatch = |value: &Value| {
            DaqError::Type(format!("cannot recast {} '{}' to {}", value.kind(), value, kind))
        };

        match (kind, self) {
            (_, Value::String(s)) if kind != ValueKind::String => {
                let inferred = Value::recast(&s)?;
                if inferred.kind() == ValueKind::String {
                    Err(mismatch(&inferred))
                } else {
                    inferred.recast_to(kind)
                }
            }
            (ValueKind::String, value) => Ok(Value::String(value.to_string())),
            (ValueKind::Array, value) => Ok(Value::Array(vec![value])),
            (_, value @ Value::Array(_)) => Err(mismatch(&value)),
            (ValueKind::Boolean, value) => value.as_bool().map(Value::Boolean).ok_or_else(|| mismatch(&value)),
            (ValueKind::Toggle, value) => match value.as_f64() {
                Some(x) if x == 0.0 || x == 1.0 => Ok(Value::Toggle(Toggle::from(x == 1.0))),
                _ => Err(mismatch(&value)),
            },
            (ValueKind::Integer, value) => match value.as_f64() {
                Some(x) if x.is_finite() => Ok(Value::Integer(x.round() as i64)),
                _ => Err(mismatch(&value)),
            },
            (ValueKind::Float, value) => value.as_f64().map(Value::Float).ok_or_else(|| mismatch(&value)),
        }
    }
}

fn looks_like_integer(text: &str) -> bool {
    let digits = text.strip_prefix(['-', '+']).unwrap_or(text);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Value::from_json(&json).map_err(serde::de::Error::custom)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<Toggle> for Value {
    fn from(value: Toggle) -> Self {
        Value::Toggle(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Vec<f64>> for Value {
    fn from(value: Vec<f64>) -> Self {
        Value::Array(value.into_iter().map(Value::Float).collect())
    }
}
