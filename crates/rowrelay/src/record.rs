// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Relayed records
//!
//! A [`Record`] is an ordered mapping from field name to a scalar JSON value
//! (null, boolean, number or string). Field order is the order the source
//! produced the columns in and survives the JSON wire encoding, which is
//! what the log uses to order newly discovered columns.

use crate::error::RelayError;
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;
use std::fmt;

/// Value of the ordering column of a source row.
///
/// Integer keys stay integers end to end so large epoch timestamps compare
/// exactly; real keys are ordered with IEEE total ordering.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OrderingKey {
    Int(i64),
    Real(f64),
}

impl OrderingKey {
    /// Extract an ordering key from a JSON number.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Self::Int(i)),
                None => n.as_f64().map(Self::Real),
            },
            _ => None,
        }
    }

    /// JSON representation of the key.
    pub fn to_json(self) -> Value {
        match self {
            Self::Int(i) => Value::from(i),
            Self::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Self::Int(i) => i as f64,
            Self::Real(f) => f,
        }
    }
}

impl Ord for OrderingKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Real(a), Self::Real(b)) => a.partial_cmp(b).unwrap_or_else(|| a.total_cmp(b)),
            (Self::Int(a), Self::Real(b)) => cmp_int_real(*a, *b),
            (Self::Real(a), Self::Int(b)) => cmp_int_real(*b, *a).reverse(),
        }
    }
}

/// Exact integer/real comparison, no rounding of the integer through `f64`.
/// NaN sorts like `f64::total_cmp` does: positive above everything,
/// negative below.
fn cmp_int_real(int: i64, real: f64) -> Ordering {
    // 2^63, exactly representable
    const BOUND: f64 = 9_223_372_036_854_775_808.0;

    if real.is_nan() {
        return if real.is_sign_negative() {
            Ordering::Greater
        } else {
            Ordering::Less
        };
    }
    if real >= BOUND {
        return Ordering::Less;
    }
    if real < -BOUND {
        return Ordering::Greater;
    }

    // |whole| < 2^63 so the cast is exact
    let whole = real.trunc();
    match int.cmp(&(whole as i64)) {
        Ordering::Equal => 0.0_f64
            .partial_cmp(&(real - whole))
            .unwrap_or(Ordering::Equal),
        unequal => unequal,
    }
}

impl PartialOrd for OrderingKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for OrderingKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderingKey {}

impl From<i64> for OrderingKey {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for OrderingKey {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for OrderingKey {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl fmt::Display for OrderingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{}", i),
            Self::Real(r) => write!(f, "{}", r),
        }
    }
}

/// One source row, immutable once read.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Record {
    fields: Map<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`Record::insert`].
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    /// Set a field. Arrays and objects are stored as their JSON text so the
    /// record only ever holds scalars.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let value = value.into();
        let value = if is_scalar(&value) {
            value
        } else {
            Value::String(value.to_string())
        };
        self.fields.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Fields in source order.
    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Ordering key stored under `column`, if it holds a number.
    pub fn ordering_key(&self, column: &str) -> Option<OrderingKey> {
        self.fields.get(column).and_then(OrderingKey::from_json)
    }

    /// Encode as a message payload (a JSON object, keys in field order).
    pub fn to_message(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.fields)
    }

    /// Decode a message payload produced by [`Record::to_message`].
    pub fn from_message(payload: &[u8]) -> Result<Self, RelayError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| RelayError::Decode(format!("invalid JSON: {}", e)))?;

        let Value::Object(fields) = value else {
            return Err(RelayError::Decode(format!(
                "expected a JSON object, got {}",
                json_kind(&value)
            )));
        };

        if let Some((name, value)) = fields.iter().find(|(_, v)| !is_scalar(v)) {
            return Err(RelayError::Decode(format!(
                "field '{}' holds a {}, expected a scalar",
                name,
                json_kind(value)
            )));
        }

        Ok(Self { fields })
    }
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Map a SQLite cell onto a record scalar.
///
/// Non-finite reals become null; blobs are carried as lossy UTF-8 text.
pub(crate) fn json_from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
    }
}

/// Map a record scalar onto a SQLite value.
pub(crate) fn sql_from_json(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map(SqlValue::Real).unwrap_or(SqlValue::Null),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}
