// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Payload interpretation.
//!
//! A payload is either a flat JSON object (one field per key) or a scalar
//! value. Producers are untrusted, so interpretation never fails: anything
//! that is not a usable flat object falls back to [`PayloadValue::Scalar`].

use crate::influx::FieldValue;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Interpreted message payload.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadValue {
    /// The raw payload text, not yet coerced.
    Scalar(String),
    /// Top-level keys of a flat JSON object with normalized values.
    Structured(BTreeMap<String, FieldValue>),
}

/// Interpret a raw payload.
///
/// Fallback order:
/// 1. not valid JSON -> `Scalar`
/// 2. valid JSON but not an object -> `Scalar`
/// 3. empty object -> `Scalar`
/// 4. any key is empty, or any value is an object, array or `null` -> `Scalar`
/// 5. otherwise `Structured`
///
/// Every `Scalar` carries the unmodified payload text.
pub fn interpret(raw: &[u8]) -> PayloadValue {
    match serde_json::from_slice::<Value>(raw) {
        Ok(Value::Object(map)) => match flatten_object(&map) {
            Some(fields) => PayloadValue::Structured(fields),
            None => scalar(raw),
        },
        Ok(_) | Err(_) => scalar(raw),
    }
}

/// Coerce a raw value to a float when it is an exact floating-point literal.
///
/// No whitespace is trimmed. Non-finite literals (`inf`, `NaN`) stay strings.
pub fn coerce_numeric(raw: &str) -> FieldValue {
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() => FieldValue::Float(v),
        _ => FieldValue::String(raw.to_string()),
    }
}

fn scalar(raw: &[u8]) -> PayloadValue {
    PayloadValue::Scalar(String::from_utf8_lossy(raw).into_owned())
}

/// Normalize a depth-1 object. Returns `None` if it cannot become a field set.
fn flatten_object(map: &Map<String, Value>) -> Option<BTreeMap<String, FieldValue>> {
    if map.is_empty() {
        return None;
    }

    let mut fields = BTreeMap::new();
    for (key, value) in map {
        // Line Protocol has no empty field keys
        if key.is_empty() {
            return None;
        }
        fields.insert(key.clone(), normalize_value(value)?);
    }
    Some(fields)
}

fn normalize_value(value: &Value) -> Option<FieldValue> {
    match value {
        Value::Bool(b) => Some(FieldValue::Float(if *b { 1.0 } else { 0.0 })),
        Value::Number(n) => n.as_f64().map(FieldValue::Float),
        Value::String(s) => Some(coerce_numeric(s)),
        // Nested values and null make the payload non-flat
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}
