use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::value::RawValue;
use tracing::warn;

use crate::cdc_error;
use crate::conversions::bool::parse_bool;
use crate::conversions::hex::{encode_hex, parse_bytea_hex};
use crate::error::{CdcError, CdcResult, ErrorKind};
use crate::types::{Value, ValueKind};

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIMESTAMP_INPUT_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
const TIMESTAMP_OUTPUT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";
const TIMESTAMPTZ_INPUT_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f%#z";

/// Source column types grouped by how their values are rendered.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SourceType {
    Boolean,
    Integer,
    Float,
    Decimal,
    Bytea,
    Date,
    Timestamp,
    TimestampTz,
    Text,
}

impl SourceType {
    fn from_type_name(type_name: &str) -> SourceType {
        let normalized = normalize_type_name(type_name);
        if normalized.ends_with("[]") {
            return SourceType::Text;
        }

        match normalized.as_str() {
            "bool" | "boolean" => SourceType::Boolean,
            "smallint" | "integer" | "int" | "bigint" | "int2" | "int4" | "int8" | "oid"
            | "smallserial" | "serial" | "bigserial" | "serial2" | "serial4" | "serial8" => {
                SourceType::Integer
            }
            "real" | "double precision" | "float" | "float4" | "float8" => SourceType::Float,
            "numeric" | "decimal" | "money" => SourceType::Decimal,
            "bytea" => SourceType::Bytea,
            "date" => SourceType::Date,
            "timestamp" | "timestamp without time zone" => SourceType::Timestamp,
            "timestamptz" | "timestamp with time zone" => SourceType::TimestampTz,
            _ => SourceType::Text,
        }
    }

    fn kind(self) -> ValueKind {
        match self {
            SourceType::Boolean => ValueKind::Boolean,
            SourceType::Integer => ValueKind::Integer,
            SourceType::Float => ValueKind::Float,
            SourceType::Decimal => ValueKind::Decimal,
            SourceType::Bytea => ValueKind::Binary,
            SourceType::Date | SourceType::Timestamp | SourceType::TimestampTz => {
                ValueKind::Timestamp
            }
            SourceType::Text => ValueKind::Text,
        }
    }
}

impl ValueKind {
    /// Returns the transport kind that values of the Postgres type `type_name` map to.
    ///
    /// The name is matched case-insensitively with type modifiers such as `(255)` removed.
    /// Array types and types not listed in the mapping table are carried as text.
    pub fn from_type_name(type_name: &str) -> ValueKind {
        SourceType::from_type_name(type_name).kind()
    }
}

/// Lowercases a type name, drops type modifiers and collapses whitespace.
fn normalize_type_name(type_name: &str) -> String {
    let lowercase = type_name.trim().to_lowercase();

    let mut stripped = String::with_capacity(lowercase.len());
    let mut depth = 0usize;
    for c in lowercase.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => stripped.push(c),
            _ => {}
        }
    }

    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// A JSON scalar as it appears in a payload. Numbers keep their exact text.
enum Scalar<'a> {
    Bool(bool),
    Number(&'a str),
    Text(String),
}

fn scalar<'a>(json: &'a str, type_name: &str) -> CdcResult<Scalar<'a>> {
    match json.as_bytes().first() {
        Some(b'"') => Ok(Scalar::Text(serde_json::from_str(json)?)),
        Some(b't') | Some(b'f') => Ok(Scalar::Bool(serde_json::from_str(json)?)),
        Some(b'-' | b'0'..=b'9') => Ok(Scalar::Number(json)),
        _ => Err(malformed(type_name, json)),
    }
}

fn malformed(type_name: &str, json: &str) -> CdcError {
    cdc_error!(
        ErrorKind::MalformedPayload,
        "Column value does not match its type",
        format!("A value of type '{type_name}' cannot be represented by the JSON {json}")
    )
}

/// Maps one column value of a payload to its transport [`Value`].
///
/// `type_name` is the Postgres type reported by the payload. Without it the kind is inferred
/// from the JSON shape. JSON `null` is [`Value::Null`] for every type.
pub fn map_value(type_name: Option<&str>, raw: &RawValue) -> CdcResult<Value> {
    let json = raw.get().trim();
    if json == "null" {
        return Ok(Value::Null);
    }

    let Some(type_name) = type_name else {
        return infer_value(json);
    };

    let value = scalar(json, type_name)?;
    let source_type = SourceType::from_type_name(type_name);
    let mapped = match (source_type, value) {
        (SourceType::Boolean, Scalar::Bool(b)) => Value::Boolean(b),
        (SourceType::Boolean, Scalar::Text(s)) => {
            let b = parse_bool(&s).map_err(|err| malformed(type_name, json).with_source(err))?;
            Value::Boolean(b)
        }

        (SourceType::Integer, Scalar::Number(n)) => Value::Integer(
            n.parse()
                .map_err(|err| malformed(type_name, json).with_source(err))?,
        ),
        (SourceType::Integer, Scalar::Text(s)) => Value::Integer(
            s.parse()
                .map_err(|err| malformed(type_name, json).with_source(err))?,
        ),

        (SourceType::Float, Scalar::Number(n)) => Value::Float(
            n.parse()
                .map_err(|err| malformed(type_name, json).with_source(err))?,
        ),
        (SourceType::Float, Scalar::Text(s)) => Value::Float(
            s.parse()
                .map_err(|err| malformed(type_name, json).with_source(err))?,
        ),

        (SourceType::Decimal, Scalar::Number(n)) => Value::Decimal(n.to_string()),
        (SourceType::Decimal, Scalar::Text(s)) => Value::Decimal(s),

        (SourceType::Bytea, Scalar::Text(s)) => {
            let bytes =
                parse_bytea_hex(&s).map_err(|err| malformed(type_name, json).with_source(err))?;
            Value::Binary(encode_hex(&bytes))
        }

        (SourceType::Date, Scalar::Text(s)) => render_date(&s),
        (SourceType::Timestamp, Scalar::Text(s)) => render_timestamp(&s),
        (SourceType::TimestampTz, Scalar::Text(s)) => render_timestamptz(&s),

        (SourceType::Text, Scalar::Text(s)) => Value::Text(s),
        (SourceType::Text, Scalar::Number(n)) => Value::Text(n.to_string()),
        (SourceType::Text, Scalar::Bool(b)) => Value::Text(b.to_string()),

        _ => return Err(malformed(type_name, json)),
    };

    Ok(mapped)
}

fn infer_value(json: &str) -> CdcResult<Value> {
    let value = match scalar(json, "unknown")? {
        Scalar::Bool(b) => Value::Boolean(b),
        Scalar::Number(n) => match n.parse::<i64>() {
            Ok(i) => Value::Integer(i),
            Err(_) => Value::Float(
                n.parse()
                    .map_err(|err| malformed("unknown", json).with_source(err))?,
            ),
        },
        Scalar::Text(s) => Value::Text(s),
    };

    Ok(value)
}

fn is_infinite(s: &str) -> bool {
    s == "infinity" || s == "-infinity"
}

fn render_date(s: &str) -> Value {
    if is_infinite(s) {
        warn!(value = s, "infinite date is captured as null");
        return Value::Null;
    }

    match NaiveDate::parse_from_str(s, DATE_FORMAT) {
        Ok(date) => Value::Timestamp(date.format(DATE_FORMAT).to_string()),
        Err(err) => {
            warn!(value = s, error = %err, "unparseable date is captured as null");
            Value::Null
        }
    }
}

fn render_timestamp(s: &str) -> Value {
    if is_infinite(s) {
        warn!(value = s, "infinite timestamp is captured as null");
        return Value::Null;
    }

    match NaiveDateTime::parse_from_str(s, TIMESTAMP_INPUT_FORMAT) {
        Ok(timestamp) => Value::Timestamp(timestamp.format(TIMESTAMP_OUTPUT_FORMAT).to_string()),
        Err(err) => {
            warn!(value = s, error = %err, "unparseable timestamp is captured as null");
            Value::Null
        }
    }
}

fn render_timestamptz(s: &str) -> Value {
    if is_infinite(s) {
        warn!(value = s, "infinite timestamp is captured as null");
        return Value::Null;
    }

    match DateTime::parse_from_str(s, TIMESTAMPTZ_INPUT_FORMAT) {
        Ok(timestamp) => Value::Timestamp(timestamp.to_rfc3339()),
        Err(err) => {
            warn!(value = s, error = %err, "unparseable timestamp is captured as null");
            Value::Null
        }
    }
}

/// Parses the commit timestamp a payload carries, in Postgres `timestamptz` output format.
pub fn parse_commit_timestamp(s: &str) -> CdcResult<DateTime<Utc>> {
    let timestamp = DateTime::parse_from_str(s, TIMESTAMPTZ_INPUT_FORMAT)?;
    Ok(timestamp.with_timezone(&Utc))
}
