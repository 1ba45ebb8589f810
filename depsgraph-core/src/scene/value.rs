//! Property Values
//!
//! Entities carry their editable state as a flat, insertion-ordered map of
//! named values. Evaluated copies use the same representation, so an
//! operation can read a property from either side without conversion.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Named property storage for originals and evaluated copies.
pub type Properties = IndexMap<String, Value>;

/// A single property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Value {
    Float(f64),
    Int(i64),
    Bool(bool),
    Vector([f64; 3]),
    Text(String),
}

impl Value {
    /// Numeric view of the value, if it has one.
    ///
    /// Integers and booleans are widened so drivers can combine them with
    /// float inputs.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Value::Vector(_) | Value::Text(_) => None,
        }
    }

    pub fn as_vector(&self) -> Option<[f64; 3]> {
        match self {
            Value::Vector(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<[f64; 3]> for Value {
    fn from(value: [f64; 3]) -> Self {
        Value::Vector(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Float(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Vector([x, y, z]) => write!(f, "({x}, {y}, {z})"),
            Value::Text(v) => write!(f, "{v:?}"),
        }
    }
}
