use std::fmt;

use serde::{Deserialize, Serialize};

/// The closed set of kinds a captured value is transported as.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Boolean,
    Integer,
    Float,
    /// Arbitrary precision number carried as its exact source text.
    Decimal,
    Text,
    /// Binary data carried as lowercase hex.
    Binary,
    /// Dates and timestamps carried as ISO 8601 text.
    Timestamp,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Boolean => "boolean",
            ValueKind::Integer => "integer",
            ValueKind::Float => "float",
            ValueKind::Decimal => "decimal",
            ValueKind::Text => "text",
            ValueKind::Binary => "binary",
            ValueKind::Timestamp => "timestamp",
        };

        f.write_str(name)
    }
}

/// A single typed column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Decimal(String),
    Text(String),
    Binary(String),
    Timestamp(String),
}

impl Value {
    /// Returns the kind of this value, or [`None`] for [`Value::Null`].
    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(ValueKind::Boolean),
            Value::Integer(_) => Some(ValueKind::Integer),
            Value::Float(_) => Some(ValueKind::Float),
            Value::Decimal(_) => Some(ValueKind::Decimal),
            Value::Text(_) => Some(ValueKind::Text),
            Value::Binary(_) => Some(ValueKind::Binary),
            Value::Timestamp(_) => Some(ValueKind::Timestamp),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Converts this value into `kind` when that can be done without losing information.
    ///
    /// Used when a payload carried no type names and the kind was inferred from JSON, which
    /// cannot tell an integer from a decimal with no fractional part.
    pub fn coerce_to(self, kind: ValueKind) -> Option<Value> {
        match (self, kind) {
            (Value::Null, _) => Some(Value::Null),
            (value, kind) if value.kind() == Some(kind) => Some(value),
            (Value::Integer(i), ValueKind::Decimal) => Some(Value::Decimal(i.to_string())),
            (Value::Float(f), ValueKind::Decimal) if f.is_finite() => {
                Some(Value::Decimal(f.to_string()))
            }
            (Value::Integer(i), ValueKind::Float) => Some(Value::Float(i as f64)),
            (Value::Text(s), ValueKind::Timestamp) => Some(Value::Timestamp(s)),
            (Value::Text(s), ValueKind::Decimal) => Some(Value::Decimal(s)),
            _ => None,
        }
    }
}
